use std::collections::BTreeMap;

use llmgate_protocol::openai::chat_completions::stream::ChatCompletionChunk;
use llmgate_protocol::openai::chat_completions::types::Usage;
use llmgate_protocol::openai::error::ErrorBody;
use llmgate_protocol::openai::responses::response::{
    OutputContent, OutputItem, OutputMessage, Response, ResponseObjectType, ResponseStatus,
    ResponseUsage,
};
use llmgate_protocol::openai::responses::stream::ResponseStreamEvent;

use crate::adapter::StreamEvent;

use super::response::response_id;

/// Wraps a chat-completions chunk stream into Responses streaming events:
/// one `response.created`, text deltas per choice, `response.output_item.done`
/// per choice, then a single `response.completed` carrying the accumulated
/// output. An error suppresses everything after the error event itself.
pub struct ChatToResponsesStream {
    id: String,
    model: String,
    created_at: i64,
    sequence: i64,
    created_emitted: bool,
    /// Accumulated text per choice index, in first-seen order.
    texts: BTreeMap<i64, String>,
    usage: Option<Usage>,
    errored: bool,
}

impl ChatToResponsesStream {
    pub fn new(fallback_id: impl Into<String>, model: impl Into<String>, created_at: i64) -> Self {
        Self {
            id: response_id(&fallback_id.into()),
            model: model.into(),
            created_at,
            sequence: 0,
            created_emitted: false,
            texts: BTreeMap::new(),
            usage: None,
            errored: false,
        }
    }

    pub fn errored(&self) -> bool {
        self.errored
    }

    pub fn process(&mut self, chunk: &ChatCompletionChunk) -> Vec<StreamEvent> {
        if self.errored {
            return Vec::new();
        }
        let mut events = Vec::new();

        if !self.created_emitted {
            self.created_emitted = true;
            self.id = response_id(&chunk.id);
            self.model = chunk.model.clone();
            self.created_at = chunk.created;
            let response = self.snapshot(ResponseStatus::InProgress, Vec::new(), None);
            events.push(StreamEvent::Responses(ResponseStreamEvent::Created {
                response,
                sequence_number: self.next_seq(),
            }));
        }

        if let Some(usage) = chunk.usage {
            self.usage = Some(usage);
        }

        for choice in &chunk.choices {
            if let Some(delta) = &choice.delta.content
                && !delta.is_empty()
            {
                self.texts.entry(choice.index).or_default().push_str(delta);
                events.push(StreamEvent::Responses(
                    ResponseStreamEvent::OutputTextDelta {
                        item_id: self.item_id(choice.index),
                        output_index: choice.index,
                        content_index: 0,
                        delta: delta.clone(),
                        sequence_number: self.next_seq(),
                    },
                ));
            }
        }

        events
    }

    /// Translate an upstream failure into a single Responses error event.
    pub fn fail(&mut self, message: &str) -> Vec<StreamEvent> {
        if self.errored {
            return Vec::new();
        }
        self.errored = true;
        vec![StreamEvent::Responses(ResponseStreamEvent::Error {
            error: ErrorBody {
                message: message.to_string(),
                r#type: Some("upstream_error".to_string()),
                param: None,
                code: None,
            },
        })]
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.errored {
            return Vec::new();
        }
        let mut events = Vec::new();
        if !self.created_emitted {
            self.created_emitted = true;
            let response = self.snapshot(ResponseStatus::InProgress, Vec::new(), None);
            events.push(StreamEvent::Responses(ResponseStreamEvent::Created {
                response,
                sequence_number: self.next_seq(),
            }));
        }

        let mut output = Vec::new();
        let texts: Vec<(i64, String)> =
            self.texts.iter().map(|(index, text)| (*index, text.clone())).collect();
        for (index, text) in texts {
            let item = OutputItem::Message(OutputMessage {
                id: Some(self.item_id(index)),
                role: "assistant".to_string(),
                content: vec![OutputContent::OutputText { text }],
            });
            events.push(StreamEvent::Responses(ResponseStreamEvent::OutputItemDone {
                output_index: index,
                item: item.clone(),
                sequence_number: self.next_seq(),
            }));
            output.push(item);
        }

        let output_text = self.texts.values().cloned().collect::<Vec<String>>().join("");
        let response = self.snapshot(ResponseStatus::Completed, output, Some(output_text));
        events.push(StreamEvent::Responses(ResponseStreamEvent::Completed {
            response,
            sequence_number: self.next_seq(),
        }));
        events
    }

    fn snapshot(
        &self,
        status: ResponseStatus,
        output: Vec<OutputItem>,
        output_text: Option<String>,
    ) -> Response {
        Response {
            id: self.id.clone(),
            object: ResponseObjectType::Response,
            created_at: self.created_at,
            status,
            model: self.model.clone(),
            output,
            output_text,
            usage: self.usage.map(|usage| ResponseUsage {
                input_tokens: usage.prompt_tokens,
                output_tokens: usage.completion_tokens,
                total_tokens: usage.total_tokens,
            }),
        }
    }

    fn item_id(&self, index: i64) -> String {
        format!("msg_{}_{index}", self.id)
    }

    fn next_seq(&mut self) -> i64 {
        let value = self.sequence;
        self.sequence += 1;
        value
    }
}
