use std::sync::Arc;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use llmgate_protocol::claude::messages::response::MessageResponse;
use llmgate_protocol::openai::chat_completions::response::ChatCompletionResponse;
use llmgate_protocol::openai::responses::response::Response as ResponsesResponse;
use llmgate_provider_core::{
    ErrorCategory, ProviderConfig, ProviderError, SdkCallContext, SelectedKey, TransportKind,
    classify_upstream_error, extract_error_message, is_messages_path_miss,
};
use llmgate_transform::{ApiStyle, ChatRequest, ChatResponse, adapt_request};

use crate::scheduler::CandidateScore;
use crate::state::{AppState, ProviderRuntime};
use crate::upstream_client::{
    Headers, HttpMethod, UpstreamBody, UpstreamClient, UpstreamRequest,
};

use super::wire::{self, DecodedItem, StreamFault};

/// Outcome of one upstream attempt, non-streaming.
pub enum TransportAttempt {
    Success {
        /// Upstream response, typed in the upstream's dialect.
        payload: ChatResponse,
        /// Raw JSON body when the upstream already speaks the client's
        /// dialect; passed through verbatim.
        raw: Option<JsonValue>,
        latency_ms: f64,
    },
    Failure(AttemptFailure),
}

#[derive(Debug, Clone)]
pub struct AttemptFailure {
    pub status: Option<u16>,
    pub error_text: String,
    pub retryable: bool,
    pub penalize: bool,
    pub category: ErrorCategory,
    /// True when no API key could be reserved; no upstream call was made.
    pub no_key: bool,
}

impl AttemptFailure {
    fn no_key(reason: String) -> Self {
        Self {
            status: None,
            error_text: reason,
            retryable: true,
            penalize: false,
            category: ErrorCategory::Transport,
            no_key: true,
        }
    }
}

/// Outcome of starting one upstream stream.
pub enum StreamAttempt {
    Started {
        events: tokio::sync::mpsc::Receiver<Result<DecodedItem, StreamFault>>,
        upstream_style: ApiStyle,
        selection: SelectedKey,
    },
    Failure(AttemptFailure),
}

pub struct AttemptCtx<'a> {
    pub state: &'a Arc<AppState>,
    pub client: &'a Arc<dyn UpstreamClient>,
    pub runtime: &'a Arc<ProviderRuntime>,
    pub config: &'a ProviderConfig,
    pub candidate: &'a CandidateScore,
    pub client_style: ApiStyle,
    pub request: &'a ChatRequest,
}

impl AttemptCtx<'_> {
    fn secret(&self) -> String {
        self.state.gateway.load().secret_key.clone()
    }

    async fn acquire_key(&self) -> Result<SelectedKey, AttemptFailure> {
        let secret = self.secret();
        self.runtime
            .pool
            .acquire(self.config, &self.state.cache, &secret)
            .await
            .map_err(|err| match err {
                ProviderError::NoAvailableKey { reason, .. } => AttemptFailure::no_key(reason),
                other => AttemptFailure::no_key(other.to_string()),
            })
    }

    async fn record_key_success(&self, selection: &SelectedKey) {
        let secret = self.secret();
        self.runtime
            .pool
            .record_success(selection, self.state.cache.clone(), &secret)
            .await;
    }

    async fn record_key_failure(
        &self,
        selection: &SelectedKey,
        retryable: bool,
        status: Option<u16>,
    ) {
        let secret = self.secret();
        self.runtime
            .pool
            .record_failure(
                selection,
                retryable,
                status,
                self.state.cache.clone(),
                &secret,
            )
            .await;
    }

    /// Request payload adapted into the upstream dialect, with the model id
    /// rewritten and the stream flag pinned.
    fn build_payload(
        &self,
        upstream_style: ApiStyle,
        stream: bool,
    ) -> Result<(ChatRequest, Bytes), AttemptFailure> {
        let mut adapted =
            adapt_request(self.request, upstream_style).map_err(|err| AttemptFailure {
                status: None,
                error_text: err.to_string(),
                retryable: false,
                penalize: false,
                category: ErrorCategory::Terminal,
                no_key: false,
            })?;
        adapted.set_model(&self.candidate.upstream.upstream_model_id);
        adapted.set_stream(stream);
        let body = adapted.to_json().map_err(|err| AttemptFailure {
            status: None,
            error_text: format!("request encoding failed: {err}"),
            retryable: false,
            penalize: false,
            category: ErrorCategory::Terminal,
            no_key: false,
        })?;
        Ok((adapted, Bytes::from(body.to_string())))
    }
}

/// Default auth and content headers for one upstream call. Custom provider
/// headers override; a user-supplied auth header suppresses the default.
pub fn build_upstream_headers(
    api_key: &str,
    config: &ProviderConfig,
    call_style: ApiStyle,
    is_stream: bool,
) -> Headers {
    let accept = if is_stream {
        "text/event-stream"
    } else {
        "application/json"
    };
    let mut headers: Headers = vec![
        ("accept".to_string(), accept.to_string()),
        ("content-type".to_string(), "application/json".to_string()),
    ];

    let has_custom_auth = config.custom_headers.keys().any(|name| {
        let lowered = name.trim().to_ascii_lowercase();
        lowered == "authorization" || lowered == "x-api-key" || lowered == "api-key"
    });
    if !has_custom_auth {
        match call_style {
            ApiStyle::Claude => headers.push(("x-api-key".to_string(), api_key.to_string())),
            ApiStyle::OpenAI | ApiStyle::Responses => {
                headers.push(("authorization".to_string(), format!("Bearer {api_key}")));
            }
        }
    }
    if call_style == ApiStyle::Claude {
        headers.push(("anthropic-version".to_string(), "2023-06-01".to_string()));
    }
    for (name, value) in &config.custom_headers {
        headers.retain(|(existing, _)| !existing.eq_ignore_ascii_case(name));
        headers.push((name.to_ascii_lowercase(), value.clone()));
    }
    headers
}

fn failure_from_status(config: &ProviderConfig, status: u16, body: &[u8]) -> AttemptFailure {
    let classification = classify_upstream_error(config, Some(status), body);
    AttemptFailure {
        status: Some(status),
        error_text: extract_error_message(body),
        retryable: classification.retryable,
        penalize: classification.penalize,
        category: classification.category,
        no_key: false,
    }
}

fn transport_failure(message: String) -> AttemptFailure {
    AttemptFailure {
        status: None,
        error_text: message,
        retryable: true,
        penalize: true,
        category: ErrorCategory::Transport,
        no_key: false,
    }
}

fn parse_payload(style: ApiStyle, body: &[u8]) -> Result<(ChatResponse, JsonValue), AttemptFailure> {
    let raw: JsonValue = serde_json::from_slice(body).map_err(|err| AttemptFailure {
        status: None,
        error_text: format!("invalid upstream response: {err}"),
        retryable: true,
        penalize: true,
        category: ErrorCategory::Transport,
        no_key: false,
    })?;
    let payload = match style {
        ApiStyle::OpenAI => serde_json::from_value::<ChatCompletionResponse>(raw.clone())
            .map(ChatResponse::OpenAI),
        ApiStyle::Claude => {
            serde_json::from_value::<MessageResponse>(raw.clone()).map(ChatResponse::Claude)
        }
        ApiStyle::Responses => {
            serde_json::from_value::<ResponsesResponse>(raw.clone()).map(ChatResponse::Responses)
        }
    }
    .map_err(|err| AttemptFailure {
        status: None,
        error_text: format!("unexpected upstream response shape: {err}"),
        retryable: true,
        penalize: true,
        category: ErrorCategory::Transport,
        no_key: false,
    })?;
    Ok((payload, raw))
}

/// Swap the endpoint path for the provider's chat.completions path.
fn chat_completions_fallback_url(config: &ProviderConfig, endpoint: &str) -> String {
    let path = config
        .path_for_style(ApiStyle::OpenAI)
        .unwrap_or_else(|| "/v1/chat/completions".to_string());
    match endpoint.find("://") {
        Some(scheme_end) => match endpoint[scheme_end + 3..].find('/') {
            Some(path_start) => {
                format!("{}{path}", &endpoint[..scheme_end + 3 + path_start])
            }
            None => format!("{endpoint}{path}"),
        },
        None => format!("{}{path}", config.base_url.trim_end_matches('/')),
    }
}

/// One non-streaming upstream call over the configured transport.
pub async fn execute(ctx: &AttemptCtx<'_>) -> TransportAttempt {
    match ctx.config.transport {
        TransportKind::Http => execute_http(ctx).await,
        TransportKind::Sdk => execute_sdk(ctx).await,
        TransportKind::ClaudeCli => execute_claude_cli(ctx).await,
    }
}

async fn execute_http(ctx: &AttemptCtx<'_>) -> TransportAttempt {
    let selection = match ctx.acquire_key().await {
        Ok(selection) => selection,
        Err(failure) => return TransportAttempt::Failure(failure),
    };
    let upstream_style = ctx.candidate.upstream.api_style;
    let (_, body) = match ctx.build_payload(upstream_style, false) {
        Ok(built) => built,
        Err(failure) => return TransportAttempt::Failure(failure),
    };
    let headers = build_upstream_headers(&selection.key, ctx.config, upstream_style, false);
    let started = tokio::time::Instant::now();

    let response = ctx
        .client
        .send(UpstreamRequest {
            method: HttpMethod::Post,
            url: ctx.candidate.upstream.endpoint.clone(),
            headers,
            body: Some(body),
            is_stream: false,
        })
        .await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    let response = match response {
        Ok(response) => response,
        Err(failure) => {
            let failure = transport_failure(failure.to_string());
            ctx.record_key_failure(&selection, true, None).await;
            return TransportAttempt::Failure(failure);
        }
    };
    let UpstreamBody::Bytes(bytes) = response.body else {
        let failure = transport_failure("unexpected streaming body".to_string());
        ctx.record_key_failure(&selection, true, None).await;
        return TransportAttempt::Failure(failure);
    };

    if (200..300).contains(&response.status) {
        ctx.record_key_success(&selection).await;
        return match parse_payload(upstream_style, &bytes) {
            Ok((payload, raw)) => TransportAttempt::Success {
                raw: (upstream_style == ctx.client_style).then_some(raw),
                payload,
                latency_ms,
            },
            Err(failure) => TransportAttempt::Failure(failure),
        };
    }

    // Claude messages path miss: retry this same candidate against the
    // chat.completions endpoint and synthesize a Claude-shaped response.
    if upstream_style == ApiStyle::Claude
        && is_messages_path_miss(response.status, &bytes)
    {
        debug!(
            provider = %ctx.config.id,
            status = response.status,
            "claude messages path missing; falling back to chat.completions"
        );
        return execute_http_claude_fallback(ctx, &selection, latency_ms).await;
    }

    let failure = failure_from_status(ctx.config, response.status, &bytes);
    if failure.penalize {
        ctx.record_key_failure(&selection, failure.retryable, failure.status)
            .await;
    }
    TransportAttempt::Failure(failure)
}

async fn execute_http_claude_fallback(
    ctx: &AttemptCtx<'_>,
    selection: &SelectedKey,
    base_latency_ms: f64,
) -> TransportAttempt {
    let (_, body) = match ctx.build_payload(ApiStyle::OpenAI, false) {
        Ok(built) => built,
        Err(failure) => return TransportAttempt::Failure(failure),
    };
    let url = chat_completions_fallback_url(ctx.config, &ctx.candidate.upstream.endpoint);
    let headers = build_upstream_headers(&selection.key, ctx.config, ApiStyle::OpenAI, false);
    let started = tokio::time::Instant::now();

    let response = ctx
        .client
        .send(UpstreamRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(body),
            is_stream: false,
        })
        .await;
    let latency_ms = base_latency_ms + started.elapsed().as_secs_f64() * 1000.0;

    let response = match response {
        Ok(response) => response,
        Err(failure) => {
            let failure = transport_failure(failure.to_string());
            ctx.record_key_failure(selection, true, None).await;
            return TransportAttempt::Failure(failure);
        }
    };
    let UpstreamBody::Bytes(bytes) = response.body else {
        let failure = transport_failure("unexpected streaming body".to_string());
        ctx.record_key_failure(selection, true, None).await;
        return TransportAttempt::Failure(failure);
    };

    if !(200..300).contains(&response.status) {
        let failure = failure_from_status(ctx.config, response.status, &bytes);
        if failure.penalize {
            ctx.record_key_failure(selection, failure.retryable, failure.status)
                .await;
        }
        return TransportAttempt::Failure(failure);
    }

    ctx.record_key_success(selection).await;
    match parse_payload(ApiStyle::OpenAI, &bytes) {
        Ok((payload, raw)) => TransportAttempt::Success {
            raw: (ctx.client_style == ApiStyle::OpenAI).then_some(raw),
            payload,
            latency_ms,
        },
        Err(failure) => TransportAttempt::Failure(failure),
    }
}

async fn execute_sdk(ctx: &AttemptCtx<'_>) -> TransportAttempt {
    let selection = match ctx.acquire_key().await {
        Ok(selection) => selection,
        Err(failure) => return TransportAttempt::Failure(failure),
    };
    let vendor = ctx.config.sdk_vendor.clone().unwrap_or_default();
    let driver = match ctx.state.sdk.get(&vendor) {
        Ok(driver) => driver,
        Err(err) => {
            return TransportAttempt::Failure(AttemptFailure {
                status: None,
                error_text: err.to_string(),
                retryable: false,
                penalize: false,
                category: ErrorCategory::Terminal,
                no_key: false,
            });
        }
    };

    let (adapted, _) = match ctx.build_payload(driver.native_style(), false) {
        Ok(built) => built,
        Err(failure) => return TransportAttempt::Failure(failure),
    };
    let sdk_ctx = SdkCallContext {
        provider_id: ctx.config.id.clone(),
        base_url: ctx.config.base_url.clone(),
        api_key: selection.key.clone(),
        upstream_model: ctx.candidate.upstream.upstream_model_id.clone(),
    };
    let started = tokio::time::Instant::now();
    let result = driver.generate(&sdk_ctx, &adapted).await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    match result {
        Ok(payload) => {
            ctx.record_key_success(&selection).await;
            TransportAttempt::Success {
                payload,
                raw: None,
                latency_ms,
            }
        }
        Err(err) => {
            let failure = sdk_failure(ctx.config, err);
            if failure.penalize {
                ctx.record_key_failure(&selection, failure.retryable, failure.status)
                    .await;
            }
            TransportAttempt::Failure(failure)
        }
    }
}

fn sdk_failure(config: &ProviderConfig, err: ProviderError) -> AttemptFailure {
    match err {
        ProviderError::UpstreamStatus { status, message } => {
            failure_from_status(config, status, message.as_bytes())
        }
        ProviderError::Transport(message) => transport_failure(message),
        other => AttemptFailure {
            status: None,
            error_text: other.to_string(),
            retryable: false,
            penalize: false,
            category: ErrorCategory::Terminal,
            no_key: false,
        },
    }
}

async fn execute_claude_cli(ctx: &AttemptCtx<'_>) -> TransportAttempt {
    let selection = match ctx.acquire_key().await {
        Ok(selection) => selection,
        Err(failure) => return TransportAttempt::Failure(failure),
    };
    let (_, body) = match ctx.build_payload(ApiStyle::Claude, false) {
        Ok(built) => built,
        Err(failure) => return TransportAttempt::Failure(failure),
    };
    let url = ctx.state.cli_profile.messages_url(&ctx.config.base_url);
    let headers = ctx.state.cli_profile.headers(&selection.key, false);
    let started = tokio::time::Instant::now();

    let response = ctx
        .client
        .send(UpstreamRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(body),
            is_stream: false,
        })
        .await;
    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

    let response = match response {
        Ok(response) => response,
        Err(failure) => {
            let failure = transport_failure(failure.to_string());
            ctx.record_key_failure(&selection, true, None).await;
            return TransportAttempt::Failure(failure);
        }
    };
    let UpstreamBody::Bytes(bytes) = response.body else {
        let failure = transport_failure("unexpected streaming body".to_string());
        ctx.record_key_failure(&selection, true, None).await;
        return TransportAttempt::Failure(failure);
    };

    if !(200..300).contains(&response.status) {
        let failure = failure_from_status(ctx.config, response.status, &bytes);
        if failure.penalize {
            ctx.record_key_failure(&selection, failure.retryable, failure.status)
                .await;
        }
        return TransportAttempt::Failure(failure);
    }

    ctx.record_key_success(&selection).await;
    match parse_payload(ApiStyle::Claude, &bytes) {
        Ok((payload, raw)) => TransportAttempt::Success {
            raw: (ctx.client_style == ApiStyle::Claude).then_some(raw),
            payload,
            latency_ms,
        },
        Err(failure) => TransportAttempt::Failure(failure),
    }
}

/// Start one streaming upstream call. A failure before any byte reaches the
/// client is returned as `Failure` so the loop can silently try the next
/// candidate.
pub async fn execute_stream(ctx: &AttemptCtx<'_>) -> StreamAttempt {
    match ctx.config.transport {
        TransportKind::Http => execute_http_stream(ctx).await,
        TransportKind::Sdk => execute_sdk_stream(ctx).await,
        TransportKind::ClaudeCli => execute_claude_cli_stream(ctx).await,
    }
}

async fn execute_http_stream(ctx: &AttemptCtx<'_>) -> StreamAttempt {
    let selection = match ctx.acquire_key().await {
        Ok(selection) => selection,
        Err(failure) => return StreamAttempt::Failure(failure),
    };
    let mut upstream_style = ctx.candidate.upstream.api_style;
    let mut url = ctx.candidate.upstream.endpoint.clone();

    loop {
        let (_, body) = match ctx.build_payload(upstream_style, true) {
            Ok(built) => built,
            Err(failure) => return StreamAttempt::Failure(failure),
        };
        let headers = build_upstream_headers(&selection.key, ctx.config, upstream_style, true);

        let response = ctx
            .client
            .send(UpstreamRequest {
                method: HttpMethod::Post,
                url: url.clone(),
                headers,
                body: Some(body),
                is_stream: true,
            })
            .await;

        let response = match response {
            Ok(response) => response,
            Err(failure) => {
                let failure = transport_failure(failure.to_string());
                ctx.record_key_failure(&selection, true, None).await;
                return StreamAttempt::Failure(failure);
            }
        };

        match response.body {
            UpstreamBody::Stream(bytes) => {
                return StreamAttempt::Started {
                    events: wire::spawn_sse_decoder(upstream_style, bytes),
                    upstream_style,
                    selection,
                };
            }
            UpstreamBody::Bytes(bytes) => {
                if upstream_style == ApiStyle::Claude
                    && is_messages_path_miss(response.status, &bytes)
                {
                    // Same-candidate fallback; the adapter will transcode
                    // chat chunks back into Claude events.
                    warn!(
                        provider = %ctx.config.id,
                        status = response.status,
                        "claude messages stream path missing; falling back to chat.completions"
                    );
                    upstream_style = ApiStyle::OpenAI;
                    url = chat_completions_fallback_url(ctx.config, &ctx.candidate.upstream.endpoint);
                    continue;
                }
                let failure = failure_from_status(ctx.config, response.status, &bytes);
                if failure.penalize {
                    ctx.record_key_failure(&selection, failure.retryable, failure.status)
                        .await;
                }
                return StreamAttempt::Failure(failure);
            }
        }
    }
}

async fn execute_sdk_stream(ctx: &AttemptCtx<'_>) -> StreamAttempt {
    let selection = match ctx.acquire_key().await {
        Ok(selection) => selection,
        Err(failure) => return StreamAttempt::Failure(failure),
    };
    let vendor = ctx.config.sdk_vendor.clone().unwrap_or_default();
    let driver = match ctx.state.sdk.get(&vendor) {
        Ok(driver) => driver,
        Err(err) => {
            return StreamAttempt::Failure(AttemptFailure {
                status: None,
                error_text: err.to_string(),
                retryable: false,
                penalize: false,
                category: ErrorCategory::Terminal,
                no_key: false,
            });
        }
    };
    let native_style = driver.native_style();
    let (adapted, _) = match ctx.build_payload(native_style, true) {
        Ok(built) => built,
        Err(failure) => return StreamAttempt::Failure(failure),
    };
    let sdk_ctx = SdkCallContext {
        provider_id: ctx.config.id.clone(),
        base_url: ctx.config.base_url.clone(),
        api_key: selection.key.clone(),
        upstream_model: ctx.candidate.upstream.upstream_model_id.clone(),
    };

    match driver.stream(&sdk_ctx, &adapted).await {
        Ok(mut events) => {
            // Re-frame driver events into the decoder item shape.
            let (tx, rx) = tokio::sync::mpsc::channel(16);
            tokio::spawn(async move {
                while let Some(item) = events.recv().await {
                    let mapped = match item {
                        Ok(event) => Ok(DecodedItem::Event(event)),
                        Err(ProviderError::UpstreamStatus { status, message }) => {
                            Err(StreamFault {
                                status: Some(status),
                                message,
                            })
                        }
                        Err(err) => Err(StreamFault {
                            status: None,
                            message: err.to_string(),
                        }),
                    };
                    let is_err = mapped.is_err();
                    if tx.send(mapped).await.is_err() || is_err {
                        return;
                    }
                }
            });
            StreamAttempt::Started {
                events: rx,
                upstream_style: native_style,
                selection,
            }
        }
        Err(err) => {
            let failure = sdk_failure(ctx.config, err);
            if failure.penalize {
                ctx.record_key_failure(&selection, failure.retryable, failure.status)
                    .await;
            }
            StreamAttempt::Failure(failure)
        }
    }
}

async fn execute_claude_cli_stream(ctx: &AttemptCtx<'_>) -> StreamAttempt {
    let selection = match ctx.acquire_key().await {
        Ok(selection) => selection,
        Err(failure) => return StreamAttempt::Failure(failure),
    };
    let (_, body) = match ctx.build_payload(ApiStyle::Claude, true) {
        Ok(built) => built,
        Err(failure) => return StreamAttempt::Failure(failure),
    };
    let url = ctx.state.cli_profile.messages_url(&ctx.config.base_url);
    let headers = ctx.state.cli_profile.headers(&selection.key, true);

    let response = ctx
        .client
        .send(UpstreamRequest {
            method: HttpMethod::Post,
            url,
            headers,
            body: Some(body),
            is_stream: true,
        })
        .await;

    let response = match response {
        Ok(response) => response,
        Err(failure) => {
            let failure = transport_failure(failure.to_string());
            ctx.record_key_failure(&selection, true, None).await;
            return StreamAttempt::Failure(failure);
        }
    };

    match response.body {
        UpstreamBody::Stream(bytes) => StreamAttempt::Started {
            events: wire::spawn_sse_decoder(ApiStyle::Claude, bytes),
            upstream_style: ApiStyle::Claude,
            selection,
        },
        UpstreamBody::Bytes(bytes) => {
            let failure = failure_from_status(ctx.config, response.status, &bytes);
            if failure.penalize {
                ctx.record_key_failure(&selection, failure.retryable, failure.status)
                    .await;
            }
            StreamAttempt::Failure(failure)
        }
    }
}
