use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use llmgate_protocol::claude::messages::request::CreateMessageRequest;
use llmgate_protocol::claude::messages::response::MessageResponse;
use llmgate_protocol::claude::messages::stream::MessageStreamEvent;
use llmgate_protocol::openai::chat_completions::request::ChatCompletionRequest;
use llmgate_protocol::openai::chat_completions::response::ChatCompletionResponse;
use llmgate_protocol::openai::chat_completions::stream::ChatCompletionChunk;
use llmgate_protocol::openai::error::ErrorEnvelope;
use llmgate_protocol::openai::responses::request::CreateResponseRequest;
use llmgate_protocol::openai::responses::response::Response as ResponsesResponse;
use llmgate_protocol::openai::responses::stream::ResponseStreamEvent;

use crate::generate::claude2openai;
use crate::generate::openai2claude;
use crate::generate::openai2responses;
use crate::generate::responses2openai;

/// The wire dialect a payload is expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiStyle {
    OpenAI,
    Claude,
    Responses,
}

impl ApiStyle {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApiStyle::OpenAI => "openai",
            ApiStyle::Claude => "claude",
            ApiStyle::Responses => "responses",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(ApiStyle::OpenAI),
            "claude" => Some(ApiStyle::Claude),
            "responses" => Some(ApiStyle::Responses),
            _ => None,
        }
    }
}

impl std::fmt::Display for ApiStyle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Heuristic dialect detection for endpoints that accept more than one
/// payload shape. This is the only place raw fields are probed.
pub fn detect_request_style(payload: &JsonValue) -> ApiStyle {
    let Some(object) = payload.as_object() else {
        return ApiStyle::OpenAI;
    };
    if object.contains_key("max_tokens_to_sample") || object.contains_key("anthropic_version") {
        return ApiStyle::Claude;
    }
    if object.contains_key("system") && object.contains_key("messages") {
        return ApiStyle::Claude;
    }
    if !object.contains_key("messages")
        && (object.contains_key("input") || object.contains_key("instructions"))
    {
        return ApiStyle::Responses;
    }
    ApiStyle::OpenAI
}

#[derive(Debug, Clone)]
pub enum ChatRequest {
    OpenAI(ChatCompletionRequest),
    Claude(CreateMessageRequest),
    Responses(CreateResponseRequest),
}

impl ChatRequest {
    pub fn style(&self) -> ApiStyle {
        match self {
            ChatRequest::OpenAI(_) => ApiStyle::OpenAI,
            ChatRequest::Claude(_) => ApiStyle::Claude,
            ChatRequest::Responses(_) => ApiStyle::Responses,
        }
    }

    pub fn model(&self) -> &str {
        match self {
            ChatRequest::OpenAI(request) => &request.body.model,
            ChatRequest::Claude(request) => &request.body.model,
            ChatRequest::Responses(request) => &request.body.model,
        }
    }

    pub fn set_model(&mut self, model: &str) {
        match self {
            ChatRequest::OpenAI(request) => request.body.model = model.to_string(),
            ChatRequest::Claude(request) => request.body.model = model.to_string(),
            ChatRequest::Responses(request) => request.body.model = model.to_string(),
        }
    }

    pub fn is_stream(&self) -> bool {
        match self {
            ChatRequest::OpenAI(request) => request.body.stream.unwrap_or(false),
            ChatRequest::Claude(request) => request.body.stream.unwrap_or(false),
            ChatRequest::Responses(request) => request.body.stream.unwrap_or(false),
        }
    }

    pub fn set_stream(&mut self, stream: bool) {
        match self {
            ChatRequest::OpenAI(request) => request.body.stream = Some(stream),
            ChatRequest::Claude(request) => request.body.stream = Some(stream),
            ChatRequest::Responses(request) => request.body.stream = Some(stream),
        }
    }

    pub fn to_json(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            ChatRequest::OpenAI(request) => serde_json::to_value(&request.body),
            ChatRequest::Claude(request) => serde_json::to_value(&request.body),
            ChatRequest::Responses(request) => serde_json::to_value(&request.body),
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChatResponse {
    OpenAI(ChatCompletionResponse),
    Claude(MessageResponse),
    Responses(ResponsesResponse),
}

impl ChatResponse {
    pub fn style(&self) -> ApiStyle {
        match self {
            ChatResponse::OpenAI(_) => ApiStyle::OpenAI,
            ChatResponse::Claude(_) => ApiStyle::Claude,
            ChatResponse::Responses(_) => ApiStyle::Responses,
        }
    }

    pub fn to_json(&self) -> Result<JsonValue, serde_json::Error> {
        match self {
            ChatResponse::OpenAI(response) => serde_json::to_value(response),
            ChatResponse::Claude(response) => serde_json::to_value(response),
            ChatResponse::Responses(response) => serde_json::to_value(response),
        }
    }
}

/// One decoded stream event, tagged by the dialect it is shaped as. Error
/// envelopes get their own variants so the wire layer can frame them
/// without consulting payload internals.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    OpenAIChunk(ChatCompletionChunk),
    OpenAIError(ErrorEnvelope),
    Claude(MessageStreamEvent),
    Responses(ResponseStreamEvent),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum AdaptError {
    #[error("unsupported conversion from {src} to {dst}")]
    UnsupportedPair { src: ApiStyle, dst: ApiStyle },
    #[error("stream event dialect does not match the adapter source")]
    StyleMismatch,
}

/// Convert a client request into the upstream's dialect.
pub fn adapt_request(request: &ChatRequest, target: ApiStyle) -> Result<ChatRequest, AdaptError> {
    if request.style() == target {
        return Ok(request.clone());
    }
    match (request, target) {
        (ChatRequest::OpenAI(request), ApiStyle::Claude) => Ok(ChatRequest::Claude(
            openai2claude::request::transform_request(request),
        )),
        (ChatRequest::Claude(request), ApiStyle::OpenAI) => Ok(ChatRequest::OpenAI(
            claude2openai::request::transform_request(request),
        )),
        (ChatRequest::Responses(request), ApiStyle::OpenAI) => Ok(ChatRequest::OpenAI(
            responses2openai::request::transform_request(request),
        )),
        (ChatRequest::Responses(request), ApiStyle::Claude) => {
            let chat = responses2openai::request::transform_request(request);
            Ok(ChatRequest::Claude(openai2claude::request::transform_request(&chat)))
        }
        (request, target) => Err(AdaptError::UnsupportedPair {
            src: request.style(),
            dst: target,
        }),
    }
}

/// Convert an upstream response back into the client's dialect.
pub fn adapt_response(
    response: &ChatResponse,
    target: ApiStyle,
    created: i64,
) -> Result<ChatResponse, AdaptError> {
    if response.style() == target {
        return Ok(response.clone());
    }
    match (response, target) {
        (ChatResponse::Claude(message), ApiStyle::OpenAI) => Ok(ChatResponse::OpenAI(
            claude2openai::response::transform_response(message, created),
        )),
        (ChatResponse::OpenAI(chat), ApiStyle::Claude) => Ok(ChatResponse::Claude(
            openai2claude::response::transform_response(chat),
        )),
        (ChatResponse::OpenAI(chat), ApiStyle::Responses) => Ok(ChatResponse::Responses(
            openai2responses::response::transform_response(chat),
        )),
        (ChatResponse::Claude(message), ApiStyle::Responses) => {
            let chat = claude2openai::response::transform_response(message, created);
            Ok(ChatResponse::Responses(
                openai2responses::response::transform_response(&chat),
            ))
        }
        (response, target) => Err(AdaptError::UnsupportedPair {
            src: response.style(),
            dst: target,
        }),
    }
}

/// Stateful per-stream transcoder from an upstream dialect to the client's.
///
/// The invariant maintained across every arm: after an error frame has been
/// produced (by a source error event or by `fail`), no further frames are
/// emitted, including terminal frames from `finish`.
pub enum StreamAdapter {
    Passthrough {
        style: ApiStyle,
        errored: bool,
    },
    ClaudeToOpenAI(claude2openai::stream::ClaudeToOpenAIStream),
    OpenAIToClaude(openai2claude::stream::OpenAIToClaudeStream),
    OpenAIToResponses(openai2responses::stream::ChatToResponsesStream),
    ClaudeToResponses {
        first: claude2openai::stream::ClaudeToOpenAIStream,
        second: openai2responses::stream::ChatToResponsesStream,
    },
}

impl StreamAdapter {
    /// Build an adapter for a (source, target) style pair. `stream_id` and
    /// `model` seed synthesized frames until the source provides real ones;
    /// `created` is the unix timestamp stamped on synthetic frames.
    pub fn new(
        src: ApiStyle,
        dst: ApiStyle,
        stream_id: &str,
        model: &str,
        created: i64,
    ) -> Result<Self, AdaptError> {
        if src == dst {
            return Ok(StreamAdapter::Passthrough {
                style: src,
                errored: false,
            });
        }
        match (src, dst) {
            (ApiStyle::Claude, ApiStyle::OpenAI) => Ok(StreamAdapter::ClaudeToOpenAI(
                claude2openai::stream::ClaudeToOpenAIStream::new(stream_id, model, created),
            )),
            (ApiStyle::OpenAI, ApiStyle::Claude) => Ok(StreamAdapter::OpenAIToClaude(
                openai2claude::stream::OpenAIToClaudeStream::new(
                    format!("msg_{stream_id}"),
                    model,
                ),
            )),
            (ApiStyle::OpenAI, ApiStyle::Responses) => Ok(StreamAdapter::OpenAIToResponses(
                openai2responses::stream::ChatToResponsesStream::new(stream_id, model, created),
            )),
            (ApiStyle::Claude, ApiStyle::Responses) => Ok(StreamAdapter::ClaudeToResponses {
                first: claude2openai::stream::ClaudeToOpenAIStream::new(stream_id, model, created),
                second: openai2responses::stream::ChatToResponsesStream::new(
                    stream_id, model, created,
                ),
            }),
            (src, dst) => Err(AdaptError::UnsupportedPair { src, dst }),
        }
    }

    pub fn errored(&self) -> bool {
        match self {
            StreamAdapter::Passthrough { errored, .. } => *errored,
            StreamAdapter::ClaudeToOpenAI(state) => state.errored(),
            StreamAdapter::OpenAIToClaude(state) => state.errored(),
            StreamAdapter::OpenAIToResponses(state) => state.errored(),
            StreamAdapter::ClaudeToResponses { first, second } => {
                first.errored() || second.errored()
            }
        }
    }

    pub fn process(&mut self, event: StreamEvent) -> Result<Vec<StreamEvent>, AdaptError> {
        match self {
            StreamAdapter::Passthrough { style, errored } => {
                if *errored {
                    return Ok(Vec::new());
                }
                match (&event, *style) {
                    (StreamEvent::OpenAIError(_), ApiStyle::OpenAI)
                    | (
                        StreamEvent::Claude(MessageStreamEvent::Error { .. }),
                        ApiStyle::Claude,
                    )
                    | (
                        StreamEvent::Responses(ResponseStreamEvent::Error { .. }),
                        ApiStyle::Responses,
                    ) => {
                        *errored = true;
                        Ok(vec![event])
                    }
                    (StreamEvent::OpenAIChunk(_), ApiStyle::OpenAI)
                    | (StreamEvent::Claude(_), ApiStyle::Claude)
                    | (StreamEvent::Responses(_), ApiStyle::Responses) => Ok(vec![event]),
                    _ => Err(AdaptError::StyleMismatch),
                }
            }
            StreamAdapter::ClaudeToOpenAI(state) => match event {
                StreamEvent::Claude(event) => Ok(state.process(event)),
                _ => Err(AdaptError::StyleMismatch),
            },
            StreamAdapter::OpenAIToClaude(state) => match event {
                StreamEvent::OpenAIChunk(chunk) => Ok(state
                    .process(&chunk)
                    .into_iter()
                    .map(StreamEvent::Claude)
                    .collect()),
                StreamEvent::OpenAIError(envelope) => Ok(state
                    .fail(&envelope.error.message)
                    .into_iter()
                    .map(StreamEvent::Claude)
                    .collect()),
                _ => Err(AdaptError::StyleMismatch),
            },
            StreamAdapter::OpenAIToResponses(state) => match event {
                StreamEvent::OpenAIChunk(chunk) => Ok(state.process(&chunk)),
                StreamEvent::OpenAIError(envelope) => Ok(state.fail(&envelope.error.message)),
                _ => Err(AdaptError::StyleMismatch),
            },
            StreamAdapter::ClaudeToResponses { first, second } => match event {
                StreamEvent::Claude(event) => {
                    let mut out = Vec::new();
                    for intermediate in first.process(event) {
                        out.extend(feed_responses(second, intermediate)?);
                    }
                    Ok(out)
                }
                _ => Err(AdaptError::StyleMismatch),
            },
        }
    }

    /// Translate an upstream failure into a single in-band error frame in
    /// the client's dialect.
    pub fn fail(&mut self, message: &str) -> Vec<StreamEvent> {
        match self {
            StreamAdapter::Passthrough { style, errored } => {
                if *errored {
                    return Vec::new();
                }
                *errored = true;
                vec![error_frame(*style, message)]
            }
            StreamAdapter::ClaudeToOpenAI(state) => state.fail(message),
            StreamAdapter::OpenAIToClaude(state) => state
                .fail(message)
                .into_iter()
                .map(StreamEvent::Claude)
                .collect(),
            StreamAdapter::OpenAIToResponses(state) => state.fail(message),
            StreamAdapter::ClaudeToResponses { first, second } => {
                first.fail(message);
                second.fail(message)
            }
        }
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        match self {
            StreamAdapter::Passthrough { .. } => Vec::new(),
            StreamAdapter::ClaudeToOpenAI(state) => state.finish(),
            StreamAdapter::OpenAIToClaude(state) => state
                .finish()
                .into_iter()
                .map(StreamEvent::Claude)
                .collect(),
            StreamAdapter::OpenAIToResponses(state) => state.finish(),
            StreamAdapter::ClaudeToResponses { first, second } => {
                let mut out = Vec::new();
                for intermediate in first.finish() {
                    out.extend(feed_responses(second, intermediate).unwrap_or_default());
                }
                out.extend(second.finish());
                out
            }
        }
    }
}

fn feed_responses(
    state: &mut openai2responses::stream::ChatToResponsesStream,
    event: StreamEvent,
) -> Result<Vec<StreamEvent>, AdaptError> {
    match event {
        StreamEvent::OpenAIChunk(chunk) => Ok(state.process(&chunk)),
        StreamEvent::OpenAIError(envelope) => Ok(state.fail(&envelope.error.message)),
        _ => Err(AdaptError::StyleMismatch),
    }
}

fn error_frame(style: ApiStyle, message: &str) -> StreamEvent {
    match style {
        ApiStyle::OpenAI => StreamEvent::OpenAIError(ErrorEnvelope::upstream_error(message)),
        ApiStyle::Claude => StreamEvent::Claude(MessageStreamEvent::Error {
            error: llmgate_protocol::claude::error::ErrorDetail {
                r#type: llmgate_protocol::claude::error::ErrorType::Custom(
                    "upstream_error".to_string(),
                ),
                message: message.to_string(),
            },
        }),
        ApiStyle::Responses => StreamEvent::Responses(ResponseStreamEvent::Error {
            error: llmgate_protocol::openai::error::ErrorBody {
                message: message.to_string(),
                r#type: Some("upstream_error".to_string()),
                param: None,
                code: None,
            },
        }),
    }
}

#[cfg(test)]
mod tests;
