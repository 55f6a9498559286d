use llmgate_protocol::openai::chat_completions::request::{
    ChatCompletionRequest, ChatCompletionRequestBody,
};
use llmgate_protocol::openai::chat_completions::types::{
    AssistantMessage, ChatMessage, SystemMessage, TextContent, UserContent, UserMessage,
};
use llmgate_protocol::openai::responses::request::{
    CreateResponseRequest, InputContent, InputContentPart, InputItem, ResponseInput,
};

/// Convert a Responses request into a chat-completions request:
/// `instructions` becomes a system message, `input` becomes the turn list.
pub fn transform_request(request: &CreateResponseRequest) -> ChatCompletionRequest {
    let body = &request.body;
    let mut messages = Vec::new();

    if let Some(instructions) = body
        .instructions
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty())
    {
        messages.push(ChatMessage::System(SystemMessage {
            content: TextContent::Text(instructions.to_string()),
            name: None,
        }));
    }

    match &body.input {
        Some(ResponseInput::Text(text)) => {
            messages.push(user_message(text.clone()));
        }
        Some(ResponseInput::Items(items)) => {
            for item in items {
                messages.push(map_item(item));
            }
        }
        None => {}
    }

    let mut out = ChatCompletionRequestBody::bare(body.model.clone(), messages);
    out.temperature = body.temperature;
    out.top_p = body.top_p;
    out.max_completion_tokens = body.max_output_tokens;
    out.stream = body.stream;
    out.user = body.user.clone();

    ChatCompletionRequest { body: out }
}

fn map_item(item: &InputItem) -> ChatMessage {
    let text = flatten_content(&item.content);
    match item.role.as_deref() {
        Some("assistant") => ChatMessage::Assistant(AssistantMessage {
            content: Some(TextContent::Text(text)),
            name: None,
            tool_calls: None,
        }),
        Some("system") | Some("developer") => ChatMessage::System(SystemMessage {
            content: TextContent::Text(text),
            name: None,
        }),
        _ => user_message(text),
    }
}

fn user_message(text: String) -> ChatMessage {
    ChatMessage::User(UserMessage {
        content: UserContent::Text(text),
        name: None,
    })
}

fn flatten_content(content: &InputContent) -> String {
    match content {
        InputContent::Text(text) => text.clone(),
        InputContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                InputContentPart::InputText { text } | InputContentPart::OutputText { text } => {
                    text.as_str()
                }
            })
            .collect::<Vec<&str>>()
            .join(""),
    }
}
