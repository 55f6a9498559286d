use serde::{Deserialize, Serialize};

use crate::openai::error::ErrorBody;
use crate::openai::responses::response::{OutputItem, Response};

/// Subset of the Responses streaming event family emitted by the gateway's
/// chat-to-responses wrapper. Tagged by the wire `type` field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ResponseStreamEvent {
    #[serde(rename = "response.created")]
    Created {
        response: Response,
        sequence_number: i64,
    },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta {
        item_id: String,
        output_index: i64,
        content_index: i64,
        delta: String,
        sequence_number: i64,
    },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone {
        output_index: i64,
        item: OutputItem,
        sequence_number: i64,
    },
    #[serde(rename = "response.completed")]
    Completed {
        response: Response,
        sequence_number: i64,
    },
    #[serde(rename = "error")]
    Error { error: ErrorBody },
}

impl ResponseStreamEvent {
    /// Wire event name for `event:` framing.
    pub fn event_name(&self) -> &'static str {
        match self {
            ResponseStreamEvent::Created { .. } => "response.created",
            ResponseStreamEvent::OutputTextDelta { .. } => "response.output_text.delta",
            ResponseStreamEvent::OutputItemDone { .. } => "response.output_item.done",
            ResponseStreamEvent::Completed { .. } => "response.completed",
            ResponseStreamEvent::Error { .. } => "error",
        }
    }
}
