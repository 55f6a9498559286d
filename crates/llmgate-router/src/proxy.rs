use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{Value as JsonValue, json};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, warn};

use llmgate_core::auth::{self, AuthContext};
use llmgate_core::engine::{ChatCallContext, ChatOutcome, GatewayEngine};
use llmgate_core::error::GatewayError;
use llmgate_protocol::claude::messages::request::{CreateMessageRequest, CreateMessageRequestBody};
use llmgate_protocol::claude::models::{
    ModelInfo as ClaudeModelInfo, ModelListResponse as ClaudeModelListResponse,
    ModelObjectType as ClaudeModelObjectType,
};
use llmgate_protocol::openai::chat_completions::request::{
    ChatCompletionRequest, ChatCompletionRequestBody,
};
use llmgate_protocol::openai::responses::request::{
    CreateResponseRequest, CreateResponseRequestBody,
};
use llmgate_transform::{ApiStyle, ChatRequest, detect_request_style};

#[derive(Clone)]
pub struct ProxyState {
    engine: Arc<GatewayEngine>,
}

const SESSION_HEADER: &str = "x-session-id";

pub fn gateway_router(engine: Arc<GatewayEngine>) -> Router {
    let state = ProxyState { engine };

    let authed = Router::new()
        .route("/models", get(list_models))
        .route("/v1/models", get(list_models))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/responses", post(responses))
        .route("/v1/messages", post(messages))
        .route("/context/{session_id}", get(session_context))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .merge(authed)
        .layer(middleware::from_fn(catch_panics))
        .with_state(state)
}

async fn health() -> impl IntoResponse {
    axum::Json(json!({"status": "ok"}))
}

/// Bearer / X-API-Key authentication; the resolved caller rides in request
/// extensions.
async fn require_auth(
    State(state): State<ProxyState>,
    mut request: axum::http::Request<Body>,
    next: Next,
) -> Response {
    let Some(raw_key) = extract_api_key(request.headers()) else {
        return error_response(&GatewayError::unauthorized("missing api key"));
    };
    let app = state.engine.state();
    let keys = app.gateway_keys.load_full();
    let secret = app.gateway.load().secret_key.clone();
    match auth::authenticate(&keys, &secret, &raw_key) {
        Ok(auth) => {
            request.extensions_mut().insert(auth);
            next.run(request).await
        }
        Err(err) => error_response(&err),
    }
}

fn extract_api_key(headers: &HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(header::AUTHORIZATION).and_then(|v| v.to_str().ok()) {
        let value = value.trim();
        if let Some(token) = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
        {
            let token = token.trim();
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Faults inside handlers become 500 with a correlation id; stack details
/// stay in the logs.
async fn catch_panics(request: axum::http::Request<Body>, next: Next) -> Response {
    match tokio::spawn(next.run(request)).await {
        Ok(response) => response,
        Err(join_err) => {
            let err = GatewayError::internal("internal gateway fault");
            error!(error_id = %err.error_id, panic = %join_err, "request handler panicked");
            error_response(&err)
        }
    }
}

/// Shared OpenAI/Claude models endpoint; the dialect is disambiguated by
/// the `anthropic-version` header.
async fn list_models(
    State(state): State<ProxyState>,
    auth: axum::Extension<AuthContext>,
    headers: HeaderMap,
) -> Response {
    let models = state.engine.models(&auth.0).await;
    if headers.contains_key("anthropic-version") {
        let data: Vec<ClaudeModelInfo> = models
            .data
            .into_iter()
            .map(|entry| ClaudeModelInfo {
                id: entry.id,
                r#type: ClaudeModelObjectType::Model,
                display_name: None,
                created_at: None,
            })
            .collect();
        let first_id = data.first().map(|model| model.id.clone());
        let last_id = data.last().map(|model| model.id.clone());
        return axum::Json(ClaudeModelListResponse {
            data,
            has_more: false,
            first_id,
            last_id,
        })
        .into_response();
    }
    axum::Json(models).into_response()
}

async fn session_context(
    State(state): State<ProxyState>,
    Path(session_id): Path<String>,
) -> Response {
    let entries = state.engine.context(&session_id).await;
    axum::Json(json!({"session_id": session_id, "entries": entries})).into_response()
}

/// Primary entry; OpenAI- and Claude-style payloads are auto-detected.
async fn chat_completions(
    State(state): State<ProxyState>,
    auth: axum::Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let raw: JsonValue = match serde_json::from_slice(&body) {
        Ok(raw) => raw,
        Err(err) => {
            return error_response(&GatewayError::bad_request(format!("invalid json: {err}")));
        }
    };
    let request = match detect_request_style(&raw) {
        ApiStyle::Claude => {
            match serde_json::from_value::<CreateMessageRequestBody>(raw) {
                Ok(parsed) => ChatRequest::Claude(CreateMessageRequest { body: parsed }),
                Err(err) => {
                    return error_response(&GatewayError::bad_request(format!(
                        "invalid claude payload: {err}"
                    )));
                }
            }
        }
        _ => match serde_json::from_value::<ChatCompletionRequestBody>(raw) {
            Ok(parsed) => ChatRequest::OpenAI(ChatCompletionRequest { body: parsed }),
            Err(err) => {
                return error_response(&GatewayError::bad_request(format!(
                    "invalid chat payload: {err}"
                )));
            }
        },
    };
    dispatch(state, auth.0, headers, request).await
}

async fn responses(
    State(state): State<ProxyState>,
    auth: axum::Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match serde_json::from_slice::<CreateResponseRequestBody>(&body) {
        Ok(parsed) => ChatRequest::Responses(CreateResponseRequest { body: parsed }),
        Err(err) => {
            return error_response(&GatewayError::bad_request(format!(
                "invalid responses payload: {err}"
            )));
        }
    };
    dispatch(state, auth.0, headers, request).await
}

async fn messages(
    State(state): State<ProxyState>,
    auth: axum::Extension<AuthContext>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request = match serde_json::from_slice::<CreateMessageRequestBody>(&body) {
        Ok(parsed) => ChatRequest::Claude(CreateMessageRequest { body: parsed }),
        Err(err) => {
            return error_response(&GatewayError::bad_request(format!(
                "invalid messages payload: {err}"
            )));
        }
    };
    dispatch(state, auth.0, headers, request).await
}

async fn dispatch(
    state: ProxyState,
    auth: AuthContext,
    headers: HeaderMap,
    mut request: ChatRequest,
) -> Response {
    let accept_sse = headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.contains("text/event-stream"));
    if accept_sse && !request.is_stream() {
        request.set_stream(true);
    }

    let ctx = ChatCallContext {
        trace_id: uuid::Uuid::now_v7().to_string(),
        auth,
        session_id: headers
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string),
        client_style: request.style(),
    };
    let trace_id = ctx.trace_id.clone();

    match state.engine.handle_chat(ctx, request).await {
        Ok(ChatOutcome::Json(body)) => axum::Json(body).into_response(),
        Ok(ChatOutcome::Stream { content_type, body }) => {
            let stream = ReceiverStream::new(body).map(Ok::<Bytes, std::convert::Infallible>);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, content_type)
                .header(header::CACHE_CONTROL, "no-cache")
                .body(Body::from_stream(stream))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            warn!(trace_id = %trace_id, error = %err, "chat call failed");
            error_response(&err)
        }
    }
}

fn error_response(err: &GatewayError) -> Response {
    let status = StatusCode::from_u16(err.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, axum::Json(err.clone())).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                axum::http::HeaderName::try_from(*name).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn bearer_token_wins_over_x_api_key() {
        let map = headers(&[
            ("authorization", "Bearer gk-one"),
            ("x-api-key", "gk-two"),
        ]);
        assert_eq!(extract_api_key(&map).as_deref(), Some("gk-one"));
    }

    #[test]
    fn x_api_key_is_accepted_alone() {
        let map = headers(&[("x-api-key", " gk-two ")]);
        assert_eq!(extract_api_key(&map).as_deref(), Some("gk-two"));
    }

    #[test]
    fn malformed_authorization_is_ignored() {
        let map = headers(&[("authorization", "Basic abc")]);
        assert_eq!(extract_api_key(&map), None);
        let map = headers(&[("authorization", "Bearer ")]);
        assert_eq!(extract_api_key(&map), None);
    }

    #[test]
    fn gateway_errors_serialize_with_error_id() {
        let err = GatewayError::model_not_available("gpt-x");
        let body = serde_json::to_value(&err).unwrap();
        assert_eq!(body["error_code"], "model_not_available");
        assert!(body["message"].as_str().unwrap().contains("gpt-x"));
        assert!(!body["error_id"].as_str().unwrap().is_empty());
        assert!(body.get("status").is_none());
    }
}
