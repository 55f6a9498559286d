use llmgate_protocol::gemini::generate::{Candidate, GenerateContentResponse};
use llmgate_protocol::openai::chat_completions::response::{
    ChatChoice, ChatCompletionObjectType, ChatCompletionResponse,
};
use llmgate_protocol::openai::chat_completions::types::{
    FinishReason, ResponseMessage, ResponseRole, Usage,
};

/// Convert a Gemini generateContent response into a chat-completions response.
pub fn transform_response(
    response: &GenerateContentResponse,
    id: impl Into<String>,
    model: impl Into<String>,
    created: i64,
) -> ChatCompletionResponse {
    let choices = response
        .candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| ChatChoice {
            index: candidate.index.unwrap_or(position as i64),
            message: ResponseMessage {
                role: ResponseRole::Assistant,
                content: Some(candidate_text(candidate)),
                refusal: None,
                tool_calls: None,
            },
            finish_reason: map_finish_reason(candidate.finish_reason.as_deref()),
            logprobs: None,
        })
        .collect();

    ChatCompletionResponse {
        id: id.into(),
        object: ChatCompletionObjectType::ChatCompletion,
        created,
        model: model.into(),
        choices,
        usage: response.usage_metadata.map(|meta| {
            let prompt = meta.prompt_token_count.unwrap_or(0);
            let completion = meta.candidates_token_count.unwrap_or(0);
            Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: meta.total_token_count.unwrap_or(prompt + completion),
            }
        }),
        system_fingerprint: None,
    }
}

pub fn candidate_text(candidate: &Candidate) -> String {
    candidate
        .content
        .as_ref()
        .map(|content| {
            content
                .parts
                .iter()
                .filter_map(|part| part.text.as_deref())
                .collect::<Vec<&str>>()
                .join("")
        })
        .unwrap_or_default()
}

pub fn map_finish_reason(reason: Option<&str>) -> FinishReason {
    match reason {
        Some("MAX_TOKENS") => FinishReason::Length,
        Some("SAFETY") | Some("RECITATION") | Some("BLOCKLIST") | Some("PROHIBITED_CONTENT") => {
            FinishReason::ContentFilter
        }
        _ => FinishReason::Stop,
    }
}
