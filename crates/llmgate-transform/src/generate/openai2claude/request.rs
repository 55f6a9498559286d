use llmgate_protocol::claude::messages::request::{CreateMessageRequest, CreateMessageRequestBody};
use llmgate_protocol::claude::messages::types::{
    ContentBlockParam, ImageSource, MessageContent, MessageParam, MessageRole, SystemParam, Tool,
    ToolChoice as ClaudeToolChoice, ToolInputSchema, ToolInputSchemaType, ToolResultContent,
};
use llmgate_protocol::openai::chat_completions::request::{
    ChatCompletionRequest, StopConfiguration,
};
use llmgate_protocol::openai::chat_completions::types::{
    AssistantMessage, ChatMessage, FunctionObject, NamedToolChoice, ToolCall, ToolChoice,
    ToolChoiceMode, ToolDefinition, ToolMessage, UserContent, UserMessage, UserPart,
};
use serde_json::Value as JsonValue;

/// Anthropic requires max_tokens; applied when the caller set neither field.
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Convert an OpenAI chat-completions request into a Claude messages request.
pub fn transform_request(request: &ChatCompletionRequest) -> CreateMessageRequest {
    let body = &request.body;
    let mut system_texts = Vec::new();
    let mut messages = Vec::new();

    for message in &body.messages {
        match message {
            ChatMessage::System(system) | ChatMessage::Developer(system) => {
                let text = system.content.flatten();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            ChatMessage::User(user) => messages.push(map_user_message(user)),
            ChatMessage::Assistant(assistant) => messages.push(map_assistant_message(assistant)),
            ChatMessage::Tool(tool) => messages.push(map_tool_message(tool)),
        }
    }

    let system = if system_texts.is_empty() {
        None
    } else {
        Some(SystemParam::Text(system_texts.join("\n")))
    };

    let max_tokens = body
        .max_completion_tokens
        .or(body.max_tokens)
        .and_then(|value| u32::try_from(value).ok())
        .filter(|value| *value > 0)
        .unwrap_or(DEFAULT_MAX_TOKENS);

    CreateMessageRequest {
        body: CreateMessageRequestBody {
            model: body.model.clone(),
            messages,
            max_tokens,
            system,
            stop_sequences: map_stop_sequences(body.stop.as_ref()),
            stream: body.stream,
            // Anthropic accepts 0..=1 only.
            temperature: body.temperature.map(|value| value.clamp(0.0, 1.0)),
            top_p: body.top_p,
            top_k: None,
            tools: map_tools(body.tools.as_deref()),
            tool_choice: map_tool_choice(body.tool_choice.as_ref(), body.parallel_tool_calls),
            metadata: None,
        },
    }
}

fn map_user_message(message: &UserMessage) -> MessageParam {
    let content = match &message.content {
        UserContent::Text(text) => MessageContent::Text(text.clone()),
        UserContent::Parts(parts) => {
            let mut blocks = Vec::new();
            for part in parts {
                match part {
                    UserPart::Text { text } => {
                        if !text.is_empty() {
                            blocks.push(ContentBlockParam::Text { text: text.clone() });
                        }
                    }
                    UserPart::ImageUrl { image_url } => {
                        blocks.push(map_image_url(&image_url.url));
                    }
                }
            }
            collapse_blocks(blocks)
        }
    };
    MessageParam {
        role: MessageRole::User,
        content,
    }
}

fn map_assistant_message(message: &AssistantMessage) -> MessageParam {
    let mut blocks = Vec::new();
    if let Some(content) = &message.content {
        let text = content.flatten();
        if !text.is_empty() {
            blocks.push(ContentBlockParam::Text { text });
        }
    }
    if let Some(tool_calls) = &message.tool_calls {
        for call in tool_calls {
            blocks.push(map_tool_call(call));
        }
    }
    MessageParam {
        role: MessageRole::Assistant,
        content: collapse_blocks(blocks),
    }
}

fn map_tool_message(message: &ToolMessage) -> MessageParam {
    MessageParam {
        role: MessageRole::User,
        content: MessageContent::Blocks(vec![ContentBlockParam::ToolResult {
            tool_use_id: message.tool_call_id.clone(),
            content: Some(ToolResultContent::Text(message.content.flatten())),
            is_error: None,
        }]),
    }
}

fn collapse_blocks(blocks: Vec<ContentBlockParam>) -> MessageContent {
    if blocks.len() == 1
        && let ContentBlockParam::Text { text } = &blocks[0]
    {
        return MessageContent::Text(text.clone());
    }
    MessageContent::Blocks(blocks)
}

fn map_image_url(url: &str) -> ContentBlockParam {
    if let Some((media_type, data)) = parse_data_url(url) {
        return ContentBlockParam::Image {
            source: ImageSource::Base64 { media_type, data },
        };
    }
    ContentBlockParam::Image {
        source: ImageSource::Url {
            url: url.to_string(),
        },
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}

fn map_tool_call(call: &ToolCall) -> ContentBlockParam {
    let ToolCall::Function { id, function } = call;
    ContentBlockParam::ToolUse {
        id: id.clone(),
        name: function.name.clone(),
        input: parse_tool_arguments(&function.arguments),
    }
}

fn parse_tool_arguments(arguments: &str) -> llmgate_protocol::claude::messages::types::JsonObject {
    match serde_json::from_str::<JsonValue>(arguments) {
        Ok(JsonValue::Object(map)) => map,
        Ok(other) => {
            let mut map = serde_json::Map::new();
            map.insert("arguments".to_string(), other);
            map
        }
        Err(_) => {
            let mut map = serde_json::Map::new();
            map.insert(
                "arguments".to_string(),
                JsonValue::String(arguments.to_string()),
            );
            map
        }
    }
}

fn map_tools(tools: Option<&[ToolDefinition]>) -> Option<Vec<Tool>> {
    let tools = tools?;
    if tools.is_empty() {
        return None;
    }
    Some(
        tools
            .iter()
            .map(|ToolDefinition::Function { function }| map_function_tool(function))
            .collect(),
    )
}

fn map_function_tool(function: &FunctionObject) -> Tool {
    Tool {
        name: function.name.clone(),
        description: function.description.clone(),
        input_schema: parse_input_schema(function.parameters.as_ref()),
    }
}

fn parse_input_schema(parameters: Option<&JsonValue>) -> ToolInputSchema {
    let empty = ToolInputSchema {
        r#type: ToolInputSchemaType::Object,
        properties: None,
        required: None,
    };
    let Some(object) = parameters.and_then(|value| value.as_object()) else {
        return empty;
    };
    ToolInputSchema {
        r#type: ToolInputSchemaType::Object,
        properties: object
            .get("properties")
            .and_then(|value| value.as_object())
            .cloned(),
        required: object.get("required").and_then(|value| value.as_array()).map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        }),
    }
}

fn map_tool_choice(
    choice: Option<&ToolChoice>,
    parallel_tool_calls: Option<bool>,
) -> Option<ClaudeToolChoice> {
    let disable_parallel = parallel_tool_calls.map(|value| !value);
    match choice? {
        ToolChoice::Mode(ToolChoiceMode::None) => Some(ClaudeToolChoice::None),
        ToolChoice::Mode(ToolChoiceMode::Auto) => Some(ClaudeToolChoice::Auto {
            disable_parallel_tool_use: disable_parallel,
        }),
        ToolChoice::Mode(ToolChoiceMode::Required) => Some(ClaudeToolChoice::Any {
            disable_parallel_tool_use: disable_parallel,
        }),
        ToolChoice::Named(NamedToolChoice::Function { function }) => Some(ClaudeToolChoice::Tool {
            name: function.name.clone(),
            disable_parallel_tool_use: disable_parallel,
        }),
    }
}

fn map_stop_sequences(stop: Option<&StopConfiguration>) -> Option<Vec<String>> {
    let values: Vec<String> = match stop? {
        StopConfiguration::Single(value) => vec![value.clone()],
        StopConfiguration::Many(values) => values.clone(),
    };
    let values: Vec<String> = values
        .into_iter()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .collect();
    if values.is_empty() { None } else { Some(values) }
}
