use std::collections::BTreeMap;

use llmgate_protocol::claude::error::{ErrorDetail, ErrorType};
use llmgate_protocol::claude::messages::response::{
    ContentBlock, MessageObjectType, MessageResponse,
};
use llmgate_protocol::claude::messages::stream::{
    ContentBlockDelta, MessageDeltaBody, MessageStreamEvent, StreamUsage,
};
use llmgate_protocol::claude::messages::types::{MessageRole, MessageUsage, StopReason};
use llmgate_protocol::openai::chat_completions::stream::ChatCompletionChunk;
use llmgate_protocol::openai::chat_completions::types::Usage;

use super::response::map_finish_reason;

/// Stateful transcoder from OpenAI chat chunks to Anthropic stream events.
///
/// Once `fail` has produced an `error` event no further frames are emitted,
/// including the `message_delta`/`message_stop` finalization pair.
pub struct OpenAIToClaudeStream {
    message_id: String,
    model: String,
    started: bool,
    next_block_index: u32,
    open_block: Option<OpenBlock>,
    /// OpenAI tool-call index -> Claude content block index.
    tool_blocks: BTreeMap<i64, u32>,
    stop_reason: Option<StopReason>,
    usage: Option<Usage>,
    errored: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OpenBlock {
    Text(u32),
    ToolUse(u32),
}

impl OpenAIToClaudeStream {
    pub fn new(message_id: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            model: model.into(),
            started: false,
            next_block_index: 0,
            open_block: None,
            tool_blocks: BTreeMap::new(),
            stop_reason: None,
            usage: None,
            errored: false,
        }
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    pub fn process(&mut self, chunk: &ChatCompletionChunk) -> Vec<MessageStreamEvent> {
        if self.errored {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.ensure_started(&mut events);

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        // Anthropic messages are single-choice; only choice 0 is transcoded.
        for choice in chunk.choices.iter().filter(|choice| choice.index == 0) {
            if let Some(content) = &choice.delta.content
                && !content.is_empty()
            {
                self.ensure_text_block(&mut events);
                events.push(MessageStreamEvent::ContentBlockDelta {
                    index: self.current_block_index(),
                    delta: ContentBlockDelta::TextDelta {
                        text: content.clone(),
                    },
                });
            }

            if let Some(tool_calls) = &choice.delta.tool_calls {
                for call in tool_calls {
                    let block_index = self.ensure_tool_block(
                        call.index,
                        call.id.as_deref(),
                        call.function.as_ref().and_then(|f| f.name.as_deref()),
                        &mut events,
                    );
                    if let Some(arguments) = call
                        .function
                        .as_ref()
                        .and_then(|f| f.arguments.as_deref())
                        .filter(|fragment| !fragment.is_empty())
                    {
                        events.push(MessageStreamEvent::ContentBlockDelta {
                            index: block_index,
                            delta: ContentBlockDelta::InputJsonDelta {
                                partial_json: arguments.to_string(),
                            },
                        });
                    }
                }
            }

            if let Some(reason) = choice.finish_reason {
                self.stop_reason = Some(map_finish_reason(reason));
            }
        }

        events
    }

    /// Translate an upstream failure into a single Anthropic error event.
    pub fn fail(&mut self, message: &str) -> Vec<MessageStreamEvent> {
        if self.errored {
            return Vec::new();
        }
        self.errored = true;
        vec![MessageStreamEvent::Error {
            error: ErrorDetail {
                r#type: ErrorType::Custom("upstream_error".to_string()),
                message: message.to_string(),
            },
        }]
    }

    pub fn finish(&mut self) -> Vec<MessageStreamEvent> {
        if self.errored {
            return Vec::new();
        }
        let mut events = Vec::new();
        self.ensure_started(&mut events);
        self.close_open_block(&mut events);
        events.push(MessageStreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(self.stop_reason.unwrap_or(StopReason::EndTurn)),
                stop_sequence: None,
            },
            usage: self.usage.map(|usage| StreamUsage {
                input_tokens: Some(usage.prompt_tokens),
                output_tokens: Some(usage.completion_tokens),
            }),
        });
        events.push(MessageStreamEvent::MessageStop);
        events
    }

    fn ensure_started(&mut self, events: &mut Vec<MessageStreamEvent>) {
        if self.started {
            return;
        }
        self.started = true;
        events.push(MessageStreamEvent::MessageStart {
            message: MessageResponse {
                id: self.message_id.clone(),
                r#type: MessageObjectType::Message,
                role: MessageRole::Assistant,
                model: self.model.clone(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: MessageUsage {
                    input_tokens: 0,
                    output_tokens: 0,
                },
            },
        });
    }

    fn ensure_text_block(&mut self, events: &mut Vec<MessageStreamEvent>) {
        if matches!(self.open_block, Some(OpenBlock::Text(_))) {
            return;
        }
        self.close_open_block(events);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = Some(OpenBlock::Text(index));
        events.push(MessageStreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::Text {
                text: String::new(),
            },
        });
    }

    fn ensure_tool_block(
        &mut self,
        tool_index: i64,
        id: Option<&str>,
        name: Option<&str>,
        events: &mut Vec<MessageStreamEvent>,
    ) -> u32 {
        if let Some(block_index) = self.tool_blocks.get(&tool_index) {
            return *block_index;
        }
        self.close_open_block(events);
        let index = self.next_block_index;
        self.next_block_index += 1;
        self.open_block = Some(OpenBlock::ToolUse(index));
        self.tool_blocks.insert(tool_index, index);
        events.push(MessageStreamEvent::ContentBlockStart {
            index,
            content_block: ContentBlock::ToolUse {
                id: id.unwrap_or("tool_use").to_string(),
                name: name.unwrap_or_default().to_string(),
                input: serde_json::Map::new(),
            },
        });
        index
    }

    fn close_open_block(&mut self, events: &mut Vec<MessageStreamEvent>) {
        if let Some(block) = self.open_block.take() {
            let index = match block {
                OpenBlock::Text(index) | OpenBlock::ToolUse(index) => index,
            };
            events.push(MessageStreamEvent::ContentBlockStop { index });
        }
    }

    fn current_block_index(&self) -> u32 {
        match self.open_block {
            Some(OpenBlock::Text(index)) | Some(OpenBlock::ToolUse(index)) => index,
            None => 0,
        }
    }
}
