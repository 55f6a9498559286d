use llmgate_protocol::claude::messages::response::{
    ContentBlock, MessageObjectType, MessageResponse,
};
use llmgate_protocol::claude::messages::types::{MessageRole, MessageUsage, StopReason};
use llmgate_protocol::openai::chat_completions::response::ChatCompletionResponse;
use llmgate_protocol::openai::chat_completions::types::{FinishReason, ToolCall};
use serde_json::Value as JsonValue;

/// Convert an OpenAI chat-completions response into a Claude message.
///
/// Only the first choice is representable in the Messages shape; extra
/// choices are dropped.
pub fn transform_response(response: &ChatCompletionResponse) -> MessageResponse {
    let choice = response.choices.first();

    let mut content = Vec::new();
    if let Some(choice) = choice {
        if let Some(text) = &choice.message.content
            && !text.is_empty()
        {
            content.push(ContentBlock::Text { text: text.clone() });
        }
        if let Some(tool_calls) = &choice.message.tool_calls {
            for call in tool_calls {
                content.push(map_tool_call(call));
            }
        }
    }

    let stop_reason = choice.map(|choice| map_finish_reason(choice.finish_reason));

    MessageResponse {
        id: claude_message_id(&response.id),
        r#type: MessageObjectType::Message,
        role: MessageRole::Assistant,
        model: response.model.clone(),
        content,
        stop_reason,
        stop_sequence: None,
        usage: MessageUsage {
            input_tokens: response.usage.map(|usage| usage.prompt_tokens).unwrap_or(0),
            output_tokens: response
                .usage
                .map(|usage| usage.completion_tokens)
                .unwrap_or(0),
        },
    }
}

pub fn map_finish_reason(reason: FinishReason) -> StopReason {
    match reason {
        FinishReason::Stop => StopReason::EndTurn,
        FinishReason::Length => StopReason::MaxTokens,
        FinishReason::ToolCalls => StopReason::ToolUse,
        FinishReason::ContentFilter => StopReason::EndTurn,
    }
}

pub fn claude_message_id(source_id: &str) -> String {
    if source_id.starts_with("msg_") {
        source_id.to_string()
    } else {
        format!("msg_{source_id}")
    }
}

fn map_tool_call(call: &ToolCall) -> ContentBlock {
    let ToolCall::Function { id, function } = call;
    let input = match serde_json::from_str::<JsonValue>(&function.arguments) {
        Ok(JsonValue::Object(map)) => map,
        _ => serde_json::Map::new(),
    };
    ContentBlock::ToolUse {
        id: id.clone(),
        name: function.name.clone(),
        input,
    }
}
