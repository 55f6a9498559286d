use llmgate_protocol::claude::messages::request::CreateMessageRequest;
use llmgate_protocol::claude::messages::types::{
    ContentBlockParam, ImageSource, MessageContent, MessageParam, MessageRole, Tool,
    ToolChoice as ClaudeToolChoice, ToolResultBlock, ToolResultContent,
};
use llmgate_protocol::openai::chat_completions::request::{
    ChatCompletionRequest, ChatCompletionRequestBody, StopConfiguration,
};
use llmgate_protocol::openai::chat_completions::types::{
    AssistantMessage, ChatMessage, FunctionObject, ImageUrl, NamedToolChoice,
    NamedToolChoiceFunction, SystemMessage, TextContent, ToolCall, ToolCallFunction, ToolChoice,
    ToolChoiceMode, ToolDefinition, ToolMessage, UserContent, UserMessage, UserPart,
};
/// Convert a Claude messages request into an OpenAI chat-completions request.
pub fn transform_request(request: &CreateMessageRequest) -> ChatCompletionRequest {
    let body = &request.body;
    let mut messages = Vec::new();

    if let Some(system) = &body.system {
        let text = system.flatten();
        if !text.is_empty() {
            messages.push(ChatMessage::System(SystemMessage {
                content: TextContent::Text(text),
                name: None,
            }));
        }
    }

    for message in &body.messages {
        messages.extend(map_message(message));
    }

    let mut out = ChatCompletionRequestBody::bare(body.model.clone(), messages);
    out.temperature = body.temperature;
    out.top_p = body.top_p;
    out.stream = body.stream;
    out.max_tokens = Some(i64::from(body.max_tokens)).filter(|value| *value > 0);
    out.stop = body.stop_sequences.as_ref().and_then(|values| {
        if values.is_empty() {
            None
        } else {
            Some(StopConfiguration::Many(values.clone()))
        }
    });
    out.tools = map_tools(body.tools.as_deref());
    out.tool_choice = map_tool_choice(body.tool_choice.as_ref());

    ChatCompletionRequest { body: out }
}

fn map_message(message: &MessageParam) -> Vec<ChatMessage> {
    let mut texts = Vec::new();
    let mut images = Vec::new();
    let mut tool_calls = Vec::new();
    let mut tool_results = Vec::new();

    match &message.content {
        MessageContent::Text(text) => texts.push(text.clone()),
        MessageContent::Blocks(blocks) => {
            for block in blocks {
                match block {
                    ContentBlockParam::Text { text } => texts.push(text.clone()),
                    ContentBlockParam::Image { source } => images.push(map_image(source)),
                    ContentBlockParam::ToolUse { id, name, input } => {
                        tool_calls.push(ToolCall::Function {
                            id: id.clone(),
                            function: ToolCallFunction {
                                name: name.clone(),
                                arguments: serde_json::to_string(input)
                                    .unwrap_or_else(|_| "{}".to_string()),
                            },
                        });
                    }
                    ContentBlockParam::ToolResult {
                        tool_use_id,
                        content,
                        ..
                    } => {
                        tool_results.push(ChatMessage::Tool(ToolMessage {
                            content: TextContent::Text(flatten_tool_result(content.as_ref())),
                            tool_call_id: tool_use_id.clone(),
                        }));
                    }
                }
            }
        }
    }

    let text = texts.join("\n");
    let mut out = Vec::new();

    match message.role {
        MessageRole::User => {
            // Tool results ride in user turns on the Anthropic side; they
            // become dedicated tool messages for OpenAI.
            out.extend(tool_results);
            if !images.is_empty() {
                let mut parts = Vec::new();
                if !text.is_empty() {
                    parts.push(UserPart::Text { text: text.clone() });
                }
                parts.extend(images);
                out.push(ChatMessage::User(UserMessage {
                    content: UserContent::Parts(parts),
                    name: None,
                }));
            } else if !text.is_empty() {
                out.push(ChatMessage::User(UserMessage {
                    content: UserContent::Text(text),
                    name: None,
                }));
            }
        }
        MessageRole::Assistant => {
            out.push(ChatMessage::Assistant(AssistantMessage {
                content: if text.is_empty() {
                    None
                } else {
                    Some(TextContent::Text(text))
                },
                name: None,
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
            }));
        }
    }

    out
}

fn map_image(source: &ImageSource) -> UserPart {
    let url = match source {
        ImageSource::Url { url } => url.clone(),
        ImageSource::Base64 { media_type, data } => {
            format!("data:{media_type};base64,{data}")
        }
    };
    UserPart::ImageUrl {
        image_url: ImageUrl { url, detail: None },
    }
}

fn flatten_tool_result(content: Option<&ToolResultContent>) -> String {
    match content {
        Some(ToolResultContent::Text(text)) => text.clone(),
        Some(ToolResultContent::Blocks(blocks)) => blocks
            .iter()
            .map(|ToolResultBlock::Text { text }| text.as_str())
            .collect::<Vec<&str>>()
            .join("\n"),
        None => String::new(),
    }
}

fn map_tools(tools: Option<&[Tool]>) -> Option<Vec<ToolDefinition>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|tool| ToolDefinition::Function {
                function: FunctionObject {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    parameters: serde_json::to_value(&tool.input_schema).ok(),
                    strict: None,
                },
            })
            .collect(),
    )
}

fn map_tool_choice(choice: Option<&ClaudeToolChoice>) -> Option<ToolChoice> {
    match choice? {
        ClaudeToolChoice::Auto { .. } => Some(ToolChoice::Mode(ToolChoiceMode::Auto)),
        ClaudeToolChoice::Any { .. } => Some(ToolChoice::Mode(ToolChoiceMode::Required)),
        ClaudeToolChoice::None => Some(ToolChoice::Mode(ToolChoiceMode::None)),
        ClaudeToolChoice::Tool { name, .. } => Some(ToolChoice::Named(NamedToolChoice::Function {
            function: NamedToolChoiceFunction { name: name.clone() },
        })),
    }
}
