use llmgate_protocol::openai::chat_completions::response::ChatCompletionResponse;
use llmgate_protocol::openai::responses::response::{
    OutputContent, OutputItem, OutputMessage, Response, ResponseObjectType, ResponseStatus,
    ResponseUsage,
};

/// Convert a chat-completions response into a Responses API response.
pub fn transform_response(chat: &ChatCompletionResponse) -> Response {
    let response_id = response_id(&chat.id);
    let mut output = Vec::new();
    let mut texts = Vec::new();

    for choice in &chat.choices {
        let text = choice.message.content.clone().unwrap_or_default();
        texts.push(text.clone());
        output.push(OutputItem::Message(OutputMessage {
            id: Some(format!("msg_{}_{}", response_id, choice.index)),
            role: "assistant".to_string(),
            content: vec![OutputContent::OutputText { text }],
        }));
    }

    Response {
        id: response_id,
        object: ResponseObjectType::Response,
        created_at: chat.created,
        status: ResponseStatus::Completed,
        model: chat.model.clone(),
        output,
        output_text: Some(texts.join("")),
        usage: chat.usage.map(|usage| ResponseUsage {
            input_tokens: usage.prompt_tokens,
            output_tokens: usage.completion_tokens,
            total_tokens: usage.total_tokens,
        }),
    }
}

pub fn response_id(source_id: &str) -> String {
    if source_id.starts_with("resp_") {
        source_id.to_string()
    } else {
        format!("resp_{source_id}")
    }
}
