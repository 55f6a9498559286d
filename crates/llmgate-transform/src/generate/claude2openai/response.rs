use llmgate_protocol::claude::messages::response::{ContentBlock, MessageResponse};
use llmgate_protocol::claude::messages::types::StopReason;
use llmgate_protocol::openai::chat_completions::response::{
    ChatChoice, ChatCompletionObjectType, ChatCompletionResponse,
};
use llmgate_protocol::openai::chat_completions::types::{
    FinishReason, ResponseMessage, ResponseRole, ToolCall, ToolCallFunction, Usage,
};

/// Convert a Claude message into an OpenAI chat-completions response.
pub fn transform_response(message: &MessageResponse, created: i64) -> ChatCompletionResponse {
    let mut texts = Vec::new();
    let mut tool_calls = Vec::new();

    for block in &message.content {
        match block {
            ContentBlock::Text { text } => texts.push(text.as_str()),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(ToolCall::Function {
                    id: id.clone(),
                    function: ToolCallFunction {
                        name: name.clone(),
                        arguments: serde_json::to_string(input)
                            .unwrap_or_else(|_| "{}".to_string()),
                    },
                });
            }
        }
    }

    let content = texts.join("");
    let choice = ChatChoice {
        index: 0,
        message: ResponseMessage {
            role: ResponseRole::Assistant,
            content: if content.is_empty() {
                None
            } else {
                Some(content)
            },
            refusal: None,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        },
        finish_reason: map_stop_reason(message.stop_reason),
        logprobs: None,
    };

    ChatCompletionResponse {
        id: chat_completion_id(&message.id),
        object: ChatCompletionObjectType::ChatCompletion,
        created,
        model: message.model.clone(),
        choices: vec![choice],
        usage: Some(Usage {
            prompt_tokens: message.usage.input_tokens,
            completion_tokens: message.usage.output_tokens,
            total_tokens: message.usage.input_tokens + message.usage.output_tokens,
        }),
        system_fingerprint: None,
    }
}

pub fn map_stop_reason(reason: Option<StopReason>) -> FinishReason {
    match reason {
        Some(StopReason::MaxTokens) => FinishReason::Length,
        Some(StopReason::ToolUse) => FinishReason::ToolCalls,
        Some(StopReason::EndTurn) | Some(StopReason::StopSequence) | None => FinishReason::Stop,
    }
}

pub fn chat_completion_id(source_id: &str) -> String {
    if source_id.starts_with("chatcmpl") {
        source_id.to_string()
    } else {
        format!("chatcmpl-{source_id}")
    }
}
