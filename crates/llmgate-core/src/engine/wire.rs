use bytes::Bytes;

use llmgate_protocol::claude::messages::stream::MessageStreamEvent;
use llmgate_protocol::openai::chat_completions::stream::ChatCompletionChunk;
use llmgate_protocol::openai::error::ErrorEnvelope;
use llmgate_protocol::openai::responses::stream::ResponseStreamEvent;
use llmgate_protocol::sse::{self, SseDecoder};
use llmgate_transform::{ApiStyle, StreamEvent};

use crate::upstream_client::ByteStream;

pub const SSE_CONTENT_TYPE: &str = "text/event-stream";

/// One decoded upstream stream item.
#[derive(Debug)]
pub enum DecodedItem {
    Event(StreamEvent),
    /// OpenAI `[DONE]` sentinel; the stream completed cleanly.
    Done,
}

/// A stream-level upstream failure (transport drop or in-band error frame
/// that is not representable as an event).
#[derive(Debug, Clone)]
pub struct StreamFault {
    pub status: Option<u16>,
    pub message: String,
}

/// Encode one client-facing event into its SSE wire frame.
///
/// Claude and Responses dialects use named events; chat.completions uses
/// data-only frames.
pub fn encode_stream_event(event: &StreamEvent) -> Option<Bytes> {
    match event {
        StreamEvent::OpenAIChunk(chunk) => {
            let data = serde_json::to_string(chunk).ok()?;
            Some(sse::encode_data_frame(&data))
        }
        StreamEvent::OpenAIError(envelope) => {
            let data = serde_json::to_string(envelope).ok()?;
            Some(sse::encode_data_frame(&data))
        }
        StreamEvent::Claude(event) => {
            let data = serde_json::to_string(event).ok()?;
            Some(sse::encode_event_frame(event.event_name(), &data))
        }
        StreamEvent::Responses(event) => {
            let data = serde_json::to_string(event).ok()?;
            Some(sse::encode_event_frame(event.event_name(), &data))
        }
    }
}

pub fn encode_done_frame() -> Bytes {
    sse::encode_done_frame()
}

/// Spawn a task that parses an upstream SSE byte stream into typed events
/// of the given dialect. Unparsable frames are dropped; an in-band error
/// envelope on a chat.completions stream surfaces as `OpenAIError`.
pub fn spawn_sse_decoder(
    style: ApiStyle,
    mut bytes: ByteStream,
) -> tokio::sync::mpsc::Receiver<Result<DecodedItem, StreamFault>> {
    let (tx, rx) = tokio::sync::mpsc::channel(16);
    tokio::spawn(async move {
        let mut decoder = SseDecoder::new();
        while let Some(item) = bytes.recv().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(failure) => {
                    let _ = tx
                        .send(Err(StreamFault {
                            status: None,
                            message: failure.to_string(),
                        }))
                        .await;
                    return;
                }
            };
            for frame in decoder.feed(&chunk) {
                let Some(item) = decode_frame(style, &frame.data) else {
                    continue;
                };
                let done = matches!(item, DecodedItem::Done);
                if tx.send(Ok(item)).await.is_err() {
                    return;
                }
                if done {
                    return;
                }
            }
        }
        for frame in decoder.finish() {
            if let Some(item) = decode_frame(style, &frame.data)
                && tx.send(Ok(item)).await.is_err()
            {
                return;
            }
        }
    });
    rx
}

fn decode_frame(style: ApiStyle, data: &str) -> Option<DecodedItem> {
    if data.trim().is_empty() {
        return None;
    }
    match style {
        ApiStyle::OpenAI => {
            if data.trim() == sse::DONE_DATA {
                return Some(DecodedItem::Done);
            }
            if let Ok(chunk) = serde_json::from_str::<ChatCompletionChunk>(data) {
                return Some(DecodedItem::Event(StreamEvent::OpenAIChunk(chunk)));
            }
            if let Ok(envelope) = serde_json::from_str::<ErrorEnvelope>(data) {
                return Some(DecodedItem::Event(StreamEvent::OpenAIError(envelope)));
            }
            None
        }
        ApiStyle::Claude => serde_json::from_str::<MessageStreamEvent>(data)
            .ok()
            .map(|event| DecodedItem::Event(StreamEvent::Claude(event))),
        ApiStyle::Responses => serde_json::from_str::<ResponseStreamEvent>(data)
            .ok()
            .map(|event| DecodedItem::Event(StreamEvent::Responses(event))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_sentinel_is_recognized() {
        assert!(matches!(
            decode_frame(ApiStyle::OpenAI, "[DONE]"),
            Some(DecodedItem::Done)
        ));
    }

    #[test]
    fn openai_error_envelope_decodes() {
        let item = decode_frame(
            ApiStyle::OpenAI,
            r#"{"error":{"message":"boom","type":"server_error"}}"#,
        );
        assert!(matches!(
            item,
            Some(DecodedItem::Event(StreamEvent::OpenAIError(_)))
        ));
    }

    #[test]
    fn claude_event_decodes_by_type_tag() {
        let item = decode_frame(
            ApiStyle::Claude,
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"x"}}"#,
        );
        assert!(matches!(
            item,
            Some(DecodedItem::Event(StreamEvent::Claude(
                MessageStreamEvent::ContentBlockDelta { .. }
            )))
        ));
    }

    #[test]
    fn claude_frames_use_named_events() {
        let frame = encode_stream_event(&StreamEvent::Claude(MessageStreamEvent::MessageStop))
            .unwrap();
        let text = String::from_utf8(frame.to_vec()).unwrap();
        assert!(text.starts_with("event: message_stop\n"));
        assert!(text.ends_with("\n\n"));
    }

    #[test]
    fn garbage_frames_are_dropped() {
        assert!(decode_frame(ApiStyle::OpenAI, "not json").is_none());
        assert!(decode_frame(ApiStyle::Claude, "{}").is_none());
    }
}
