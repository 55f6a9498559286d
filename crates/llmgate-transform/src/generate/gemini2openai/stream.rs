use llmgate_protocol::gemini::generate::GenerateContentResponse;
use llmgate_protocol::openai::chat_completions::stream::{
    ChatCompletionChunk, ChatCompletionChunkObjectType, StreamChoice,
};
use llmgate_protocol::openai::chat_completions::types::{
    FinishReason, ResponseRole, StreamDelta, Usage,
};
use llmgate_protocol::openai::error::ErrorEnvelope;

use crate::adapter::StreamEvent;

use super::response::{candidate_text, map_finish_reason};

/// Transcodes Gemini streaming generateContent chunks into synthetic
/// `chat.completion.chunk` frames. The finish reason of the final frame is
/// derived from the last `finishReason` observed in the source.
pub struct GeminiToOpenAIStream {
    id: String,
    model: String,
    created: i64,
    role_emitted: bool,
    last_finish_reason: Option<String>,
    usage: Option<Usage>,
    errored: bool,
}

impl GeminiToOpenAIStream {
    pub fn new(id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: id.into(),
            model: model.into(),
            created,
            role_emitted: false,
            last_finish_reason: None,
            usage: None,
            errored: false,
        }
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    pub fn process(&mut self, response: &GenerateContentResponse) -> Vec<StreamEvent> {
        if self.errored {
            return Vec::new();
        }
        let mut events = Vec::new();

        if let Some(meta) = response.usage_metadata {
            let prompt = meta.prompt_token_count.unwrap_or(0);
            let completion = meta.candidates_token_count.unwrap_or(0);
            self.usage = Some(Usage {
                prompt_tokens: prompt,
                completion_tokens: completion,
                total_tokens: meta.total_token_count.unwrap_or(prompt + completion),
            });
        }

        for (position, candidate) in response.candidates.iter().enumerate() {
            if let Some(reason) = &candidate.finish_reason {
                self.last_finish_reason = Some(reason.clone());
            }
            let text = candidate_text(candidate);
            if text.is_empty() {
                continue;
            }
            let mut delta = StreamDelta::empty();
            if !self.role_emitted {
                self.role_emitted = true;
                delta.role = Some(ResponseRole::Assistant);
            }
            delta.content = Some(text);
            events.push(self.chunk(
                candidate.index.unwrap_or(position as i64),
                delta,
                None,
                None,
            ));
        }

        events
    }

    pub fn fail(&mut self, message: &str) -> Vec<StreamEvent> {
        if self.errored {
            return Vec::new();
        }
        self.errored = true;
        vec![StreamEvent::OpenAIError(ErrorEnvelope::upstream_error(
            message,
        ))]
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.errored {
            return Vec::new();
        }
        let finish_reason = map_finish_reason(self.last_finish_reason.as_deref());
        vec![self.chunk(0, StreamDelta::empty(), Some(finish_reason), self.usage)]
    }

    fn chunk(
        &self,
        index: i64,
        delta: StreamDelta,
        finish_reason: Option<FinishReason>,
        usage: Option<Usage>,
    ) -> StreamEvent {
        StreamEvent::OpenAIChunk(ChatCompletionChunk {
            id: self.id.clone(),
            object: ChatCompletionChunkObjectType::ChatCompletionChunk,
            created: self.created,
            model: self.model.clone(),
            choices: vec![StreamChoice {
                index,
                delta,
                finish_reason,
            }],
            usage,
            system_fingerprint: None,
        })
    }
}
