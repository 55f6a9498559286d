use std::collections::BTreeMap;

use llmgate_protocol::claude::messages::response::ContentBlock;
use llmgate_protocol::claude::messages::stream::{ContentBlockDelta, MessageStreamEvent};
use llmgate_protocol::openai::chat_completions::stream::{
    ChatCompletionChunk, ChatCompletionChunkObjectType, StreamChoice,
};
use llmgate_protocol::openai::chat_completions::types::{
    FinishReason, ResponseRole, StreamDelta, ToolCallChunk, ToolCallChunkFunction,
    ToolCallChunkType, Usage,
};
use llmgate_protocol::openai::error::ErrorEnvelope;

use crate::adapter::StreamEvent;

use super::response::{chat_completion_id, map_stop_reason};

/// Stateful transcoder from Anthropic stream events to OpenAI chat chunks.
///
/// A source `error` event becomes one OpenAI error frame; after that the
/// stream is poisoned and `finish` emits nothing (in particular no final
/// finish_reason chunk, and the caller must not append `[DONE]`).
pub struct ClaudeToOpenAIStream {
    id: String,
    model: String,
    created: i64,
    role_emitted: bool,
    /// Claude content block index -> OpenAI tool_call index.
    tool_indices: BTreeMap<u32, i64>,
    input_tokens: i64,
    output_tokens: i64,
    finish_reason: Option<FinishReason>,
    finished: bool,
    errored: bool,
}

impl ClaudeToOpenAIStream {
    pub fn new(fallback_id: impl Into<String>, model: impl Into<String>, created: i64) -> Self {
        Self {
            id: fallback_id.into(),
            model: model.into(),
            created,
            role_emitted: false,
            tool_indices: BTreeMap::new(),
            input_tokens: 0,
            output_tokens: 0,
            finish_reason: None,
            finished: false,
            errored: false,
        }
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    pub fn process(&mut self, event: MessageStreamEvent) -> Vec<StreamEvent> {
        if self.errored || self.finished {
            return Vec::new();
        }
        match event {
            MessageStreamEvent::MessageStart { message } => {
                self.id = chat_completion_id(&message.id);
                self.model = message.model;
                self.input_tokens = message.usage.input_tokens;
                self.role_emitted = true;
                vec![self.chunk(
                    StreamDelta {
                        role: Some(ResponseRole::Assistant),
                        content: None,
                        refusal: None,
                        tool_calls: None,
                    },
                    None,
                    None,
                )]
            }
            MessageStreamEvent::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                ContentBlock::Text { text } => {
                    if text.is_empty() {
                        Vec::new()
                    } else {
                        vec![self.content_chunk(text)]
                    }
                }
                ContentBlock::ToolUse { id, name, .. } => {
                    let tool_index = self.tool_indices.len() as i64;
                    self.tool_indices.insert(index, tool_index);
                    vec![self.tool_chunk(
                        tool_index,
                        Some(id),
                        Some(name),
                        None,
                    )]
                }
            },
            MessageStreamEvent::ContentBlockDelta { index, delta } => match delta {
                ContentBlockDelta::TextDelta { text } => vec![self.content_chunk(text)],
                ContentBlockDelta::InputJsonDelta { partial_json } => {
                    let tool_index = self.tool_indices.get(&index).copied().unwrap_or(0);
                    vec![self.tool_chunk(tool_index, None, None, Some(partial_json))]
                }
            },
            MessageStreamEvent::ContentBlockStop { .. } | MessageStreamEvent::Ping => Vec::new(),
            MessageStreamEvent::MessageDelta { delta, usage } => {
                self.finish_reason = Some(map_stop_reason(delta.stop_reason));
                if let Some(usage) = usage {
                    if let Some(input) = usage.input_tokens {
                        self.input_tokens = input;
                    }
                    if let Some(output) = usage.output_tokens {
                        self.output_tokens = output;
                    }
                }
                Vec::new()
            }
            MessageStreamEvent::MessageStop => {
                self.finished = true;
                vec![self.final_chunk()]
            }
            MessageStreamEvent::Error { error } => self.fail(&error.message),
        }
    }

    /// Translate an upstream failure into a single OpenAI error frame.
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
        if self.errored || self.finished {
            return Vec::new();
        }
        // EOF without message_stop: still close the stream cleanly.
        self.finished = true;
        vec![self.final_chunk()]
    }

    fn final_chunk(&self) -> StreamEvent {
        let usage = Usage {
            prompt_tokens: self.input_tokens,
            completion_tokens: self.output_tokens,
            total_tokens: self.input_tokens + self.output_tokens,
        };
        self.chunk(
            StreamDelta::empty(),
            Some(self.finish_reason.unwrap_or(FinishReason::Stop)),
            Some(usage),
        )
    }

    fn content_chunk(&mut self, text: String) -> StreamEvent {
        let mut delta = StreamDelta::empty();
        if !self.role_emitted {
            self.role_emitted = true;
            delta.role = Some(ResponseRole::Assistant);
        }
        delta.content = Some(text);
        self.chunk(delta, None, None)
    }

    fn tool_chunk(
        &self,
        index: i64,
        id: Option<String>,
        name: Option<String>,
        arguments: Option<String>,
    ) -> StreamEvent {
        let delta = StreamDelta {
            role: None,
            content: None,
            refusal: None,
            tool_calls: Some(vec![ToolCallChunk {
                index,
                id,
                r#type: Some(ToolCallChunkType::Function),
                function: Some(ToolCallChunkFunction { name, arguments }),
            }]),
        };
        self.chunk(delta, None, None)
    }

    fn chunk(
        &self,
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
                index: 0,
                delta,
                finish_reason,
            }],
            usage,
            system_fingerprint: None,
        })
    }
}
