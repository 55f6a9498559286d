use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde_json::Value as JsonValue;
use tracing::{debug, info, warn};

use llmgate_cache::keys;
use llmgate_protocol::openai::models::{ModelEntry, ModelList, ModelObjectType};
use llmgate_provider_core::{ErrorCategory, RoutingMetrics, SelectedKey, TransportKind};
use llmgate_transform::{ApiStyle, ChatRequest, StreamAdapter, adapt_response};

use crate::auth::AuthContext;
use crate::error::GatewayError;
use crate::resolver;
use crate::scheduler::{self, CandidateScore, ProviderSignals};
use crate::session::{self, SessionBinding};
use crate::state::{AppState, ProviderRuntime};
use crate::upstream_client::UpstreamClient;

mod transport;
mod wire;

pub use wire::SSE_CONTENT_TYPE;

use transport::{AttemptCtx, AttemptFailure, StreamAttempt, TransportAttempt};
use wire::{DecodedItem, StreamFault};

/// Per-request routing context assembled by the HTTP layer.
#[derive(Debug, Clone)]
pub struct ChatCallContext {
    pub trace_id: String,
    pub auth: AuthContext,
    /// Conversation id from `X-Session-Id`; opts into stickiness.
    pub session_id: Option<String>,
    pub client_style: ApiStyle,
}

/// What the HTTP layer writes back: a finished JSON body or an SSE stream.
pub enum ChatOutcome {
    Json(JsonValue),
    Stream {
        content_type: &'static str,
        body: tokio::sync::mpsc::Receiver<Bytes>,
    },
}

#[derive(Clone)]
pub struct GatewayEngine {
    state: Arc<AppState>,
    client: Arc<dyn UpstreamClient>,
}

/// Upstream statuses that feed the short-lived provider failure counter.
const COOLDOWN_STATUSES: [u16; 5] = [500, 502, 503, 504, 429];

impl GatewayEngine {
    pub fn new(state: Arc<AppState>, client: Arc<dyn UpstreamClient>) -> Self {
        Self { state, client }
    }

    pub fn state(&self) -> &Arc<AppState> {
        &self.state
    }

    /// Route one chat call: resolve, rank, then walk the candidates.
    pub async fn handle_chat(
        &self,
        ctx: ChatCallContext,
        request: ChatRequest,
    ) -> Result<ChatOutcome, GatewayError> {
        let logical = resolver::resolve(
            &self.state,
            &self.client,
            request.model(),
            ctx.client_style,
            &ctx.auth,
        )
        .await?;

        let strategy = self.state.strategy.load_full();
        let signals = self.load_signals(&logical).await;
        let binding = match &ctx.session_id {
            Some(session_id) if strategy.enable_stickiness => {
                session::load_binding(&self.state.cache, session_id)
                    .await
                    .filter(|binding| binding.logical_model == logical.logical_id)
            }
            _ => None,
        };

        let Some(outcome) =
            scheduler::choose(&strategy, &logical.upstreams, &signals, binding.as_ref())
        else {
            return Err(GatewayError::no_provider_available(format!(
                "no provider currently available for model '{}'",
                logical.logical_id
            )));
        };
        let ordered = scheduler::build_ordered_candidates(&outcome);
        debug!(
            trace_id = %ctx.trace_id,
            logical_model = %logical.logical_id,
            selected = %outcome.selected.upstream.provider_id,
            candidates = ordered.len(),
            "candidate order computed"
        );

        if request.is_stream() {
            let (tx, rx) = tokio::sync::mpsc::channel::<Bytes>(16);
            let loop_ctx = StreamLoop {
                state: self.state.clone(),
                client: self.client.clone(),
                ctx,
                logical_id: logical.logical_id.clone(),
                ordered,
                request,
            };
            tokio::spawn(loop_ctx.run(tx));
            Ok(ChatOutcome::Stream {
                content_type: SSE_CONTENT_TYPE,
                body: rx,
            })
        } else {
            self.try_candidates(&ctx, &logical.logical_id, &ordered, &request)
                .await
                .map(ChatOutcome::Json)
        }
    }

    /// Aggregated model list filtered by the caller's allowed providers.
    pub async fn models(&self, auth: &AuthContext) -> ModelList {
        let aggregate = self.aggregate_models().await;
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        let mut entries: Vec<ModelEntry> = aggregate
            .into_iter()
            .filter(|(_, provider)| {
                provider
                    .as_deref()
                    .is_none_or(|provider| auth.provider_allowed(provider))
            })
            .map(|(id, provider)| ModelEntry {
                id,
                object: ModelObjectType::Model,
                created: Some(now),
                owned_by: provider,
            })
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries.dedup_by(|a, b| a.id == b.id);
        ModelList::new(entries)
    }

    /// Debug ring for one conversation.
    pub async fn context(&self, session_id: &str) -> Vec<JsonValue> {
        session::load_context(&self.state.cache, session_id).await
    }

    async fn aggregate_models(&self) -> Vec<(String, Option<String>)> {
        let cache_key = keys::models_all();
        if let Ok(Some(raw)) = self.state.cache.get(&cache_key).await
            && let Ok(parsed) = serde_json::from_str::<Vec<(String, Option<String>)>>(&raw)
        {
            return parsed;
        }

        let mut aggregate: Vec<(String, Option<String>)> = Vec::new();
        for model in self.state.logical_models.load().values() {
            if model.enabled {
                aggregate.push((model.logical_id.clone(), None));
            }
        }
        let providers: Vec<_> = self.state.providers.load().values().cloned().collect();
        for runtime in providers {
            let config = runtime.config.load_full();
            if !config.enabled {
                continue;
            }
            for id in resolver::provider_models(&self.state, &self.client, &config).await {
                aggregate.push((id, Some(config.id.clone())));
            }
        }

        let ttl = Duration::from_secs(self.state.gateway.load().model_list_ttl_secs);
        if let Ok(raw) = serde_json::to_string(&aggregate)
            && let Err(err) = self.state.cache.set(&cache_key, &raw, Some(ttl)).await
        {
            debug!(error = %err, "aggregated model list cache write skipped");
        }
        aggregate
    }

    async fn load_signals(
        &self,
        logical: &llmgate_provider_core::LogicalModel,
    ) -> ProviderSignals {
        let mut signals = ProviderSignals::default();
        for upstream in &logical.upstreams {
            let provider_id = &upstream.provider_id;
            if signals.metrics.contains_key(provider_id) {
                continue;
            }
            if let Ok(Some(raw)) = self
                .state
                .cache
                .get(&keys::routing_metrics(&logical.logical_id, provider_id))
                .await
                && let Ok(metrics) = serde_json::from_str::<RoutingMetrics>(&raw)
            {
                signals.metrics.insert(provider_id.clone(), metrics);
            }
            if let Ok(Some(raw)) = self
                .state
                .cache
                .get(&keys::dynamic_weight(provider_id))
                .await
                && let Ok(weight) = raw.parse::<f64>()
            {
                signals.dynamic_weights.insert(provider_id.clone(), weight);
            }
            if let Some(runtime) = self.state.provider(provider_id) {
                let config = runtime.config.load_full();
                let exhausted = runtime.pool.all_in_backoff(&config).await;
                signals.keys_exhausted.insert(provider_id.clone(), exhausted);
            }
        }
        signals
    }

    async fn try_candidates(
        &self,
        ctx: &ChatCallContext,
        logical_id: &str,
        ordered: &[CandidateScore],
        request: &ChatRequest,
    ) -> Result<JsonValue, GatewayError> {
        let mut last_status: Option<u16> = None;
        let mut last_error: Option<String> = None;
        let mut skipped = 0usize;
        let mut attempted = false;

        for candidate in ordered {
            let provider_id = candidate.upstream.provider_id.clone();
            if self.cooldown_skip(&provider_id).await {
                skipped += 1;
                warn!(
                    trace_id = %ctx.trace_id,
                    provider = %provider_id,
                    "skipping candidate in failure cooldown"
                );
                continue;
            }
            let Some(runtime) = self.state.provider(&provider_id) else {
                last_status = Some(503);
                last_error = Some(format!("provider '{provider_id}' is not configured"));
                continue;
            };
            let config = runtime.config.load_full();
            let attempt_ctx = AttemptCtx {
                state: &self.state,
                client: &self.client,
                runtime: &runtime,
                config: &config,
                candidate,
                client_style: ctx.client_style,
                request,
            };

            let started = tokio::time::Instant::now();
            match transport::execute(&attempt_ctx).await {
                TransportAttempt::Success {
                    payload,
                    raw,
                    latency_ms,
                } => {
                    attempted = true;
                    self.clear_failure(&provider_id).await;
                    self.record_sample(
                        ctx,
                        logical_id,
                        &candidate.upstream.provider_id,
                        config.transport,
                        false,
                        true,
                        latency_ms,
                    )
                    .await;
                    self.bind_session(ctx, logical_id, candidate).await;

                    let body = match raw {
                        Some(raw) => raw,
                        None => {
                            let created = now_unix();
                            adapt_response(&payload, ctx.client_style, created)
                                .map_err(|err| GatewayError::internal(err.to_string()))?
                                .to_json()
                                .map_err(|err| GatewayError::internal(err.to_string()))?
                        }
                    };
                    self.save_context(ctx, request, &body).await;
                    return Ok(body);
                }
                TransportAttempt::Failure(failure) => {
                    if failure.no_key {
                        last_status = None;
                        last_error = Some(failure.error_text);
                        continue;
                    }
                    attempted = true;
                    let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                    self.record_sample(
                        ctx,
                        logical_id,
                        &candidate.upstream.provider_id,
                        config.transport,
                        false,
                        false,
                        latency_ms,
                    )
                    .await;
                    self.note_failure(ctx, &provider_id, &failure).await;
                    last_status = failure.status;
                    last_error = Some(failure.error_text.clone());

                    if failure.retryable {
                        continue;
                    }
                    return Err(GatewayError::upstream_failed(format!(
                        "upstream error {}: {}",
                        failure
                            .status
                            .map(|status| status.to_string())
                            .unwrap_or_else(|| "-".to_string()),
                        failure.error_text
                    )));
                }
            }
        }

        let detail = exhaustion_detail(logical_id, skipped, last_status, last_error.as_deref());
        if attempted {
            Err(GatewayError::upstream_failed(detail))
        } else {
            Err(GatewayError::no_provider_available(detail))
        }
    }

    async fn cooldown_skip(&self, provider_id: &str) -> bool {
        let threshold = self.state.gateway.load().failure_cooldown_threshold;
        match self
            .state
            .cache
            .get(&keys::provider_failures(provider_id))
            .await
        {
            Ok(Some(raw)) => raw
                .parse::<u32>()
                .map(|count| count >= threshold)
                .unwrap_or(false),
            _ => false,
        }
    }

    async fn increment_failure(&self, provider_id: &str) {
        let window = Duration::from_secs(self.state.gateway.load().failure_cooldown_secs);
        if let Err(err) = self
            .state
            .cache
            .incr(&keys::provider_failures(provider_id), window)
            .await
        {
            debug!(provider = %provider_id, error = %err, "failure counter update skipped");
        }
    }

    async fn clear_failure(&self, provider_id: &str) {
        let _ = self
            .state
            .cache
            .delete(&keys::provider_failures(provider_id))
            .await;
    }

    async fn note_failure(&self, ctx: &ChatCallContext, provider_id: &str, failure: &AttemptFailure) {
        match failure.category {
            ErrorCategory::CapabilityMismatch(capability) => {
                // Not a provider fault; the loop just moves on.
                info!(
                    trace_id = %ctx.trace_id,
                    provider = %provider_id,
                    category = format!("capability_mismatch:{}", capability.as_str()),
                    "candidate cannot serve this request shape"
                );
            }
            _ => {
                if failure.penalize
                    && failure
                        .status
                        .is_some_and(|status| COOLDOWN_STATUSES.contains(&status))
                {
                    self.increment_failure(provider_id).await;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_sample(
        &self,
        ctx: &ChatCallContext,
        logical_id: &str,
        provider_id: &str,
        transport: TransportKind,
        is_stream: bool,
        success: bool,
        latency_ms: f64,
    ) {
        self.state
            .metrics
            .record_sample(
                provider_id,
                logical_id,
                transport,
                is_stream,
                Some(&ctx.auth.user_id),
                Some(&ctx.auth.key_label),
                success,
                latency_ms,
                now_unix(),
            )
            .await;
    }

    async fn bind_session(&self, ctx: &ChatCallContext, logical_id: &str, candidate: &CandidateScore) {
        let Some(session_id) = &ctx.session_id else {
            return;
        };
        let strategy = self.state.strategy.load_full();
        if !strategy.enable_stickiness {
            return;
        }
        let binding = SessionBinding {
            logical_model: logical_id.to_string(),
            provider_id: candidate.upstream.provider_id.clone(),
            upstream_model_id: candidate.upstream.upstream_model_id.clone(),
            last_accessed: now_unix(),
        };
        session::store_binding(
            &self.state.cache,
            session_id,
            &binding,
            Duration::from_secs(strategy.stickiness_ttl_secs),
        )
        .await;
    }

    async fn save_context(&self, ctx: &ChatCallContext, request: &ChatRequest, response: &JsonValue) {
        let Some(session_id) = &ctx.session_id else {
            return;
        };
        let Ok(request_json) = request.to_json() else {
            return;
        };
        let ttl = Duration::from_secs(self.state.gateway.load().session_ttl_secs);
        session::save_context(&self.state.cache, session_id, &request_json, response, ttl).await;
    }
}

fn exhaustion_detail(
    logical_id: &str,
    skipped: usize,
    last_status: Option<u16>,
    last_error: Option<&str>,
) -> String {
    let mut detail = format!("all upstream providers failed for model '{logical_id}'");
    let mut parts = Vec::new();
    if skipped > 0 {
        parts.push(format!("skipped={skipped} (in failure cooldown)"));
    }
    if let Some(status) = last_status {
        parts.push(format!("last_status={status}"));
    }
    if let Some(error) = last_error {
        parts.push(format!("last_error={error}"));
    }
    if !parts.is_empty() {
        detail.push_str("; ");
        detail.push_str(&parts.join(", "));
    }
    detail
}

fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// The streaming candidate walk, detached from the HTTP handler. Owns the
/// client-facing byte channel: dropping the receiver (client disconnect)
/// aborts the in-flight upstream call and releases the key.
struct StreamLoop {
    state: Arc<AppState>,
    client: Arc<dyn UpstreamClient>,
    ctx: ChatCallContext,
    logical_id: String,
    ordered: Vec<CandidateScore>,
    request: ChatRequest,
}

impl StreamLoop {
    async fn run(self, tx: tokio::sync::mpsc::Sender<Bytes>) {
        let engine = GatewayEngine::new(self.state.clone(), self.client.clone());
        let mut last_status: Option<u16> = None;
        let mut last_error: Option<String> = None;
        let mut skipped = 0usize;
        let total = self.ordered.len();

        for (index, candidate) in self.ordered.iter().enumerate() {
            let is_last = index + 1 == total;
            let provider_id = candidate.upstream.provider_id.clone();

            if engine.cooldown_skip(&provider_id).await {
                skipped += 1;
                warn!(
                    trace_id = %self.ctx.trace_id,
                    provider = %provider_id,
                    "skipping stream candidate in failure cooldown"
                );
                continue;
            }
            let Some(runtime) = self.state.provider(&provider_id) else {
                last_status = Some(503);
                last_error = Some(format!("provider '{provider_id}' is not configured"));
                continue;
            };
            let config = runtime.config.load_full();
            let attempt_ctx = AttemptCtx {
                state: &self.state,
                client: &self.client,
                runtime: &runtime,
                config: &config,
                candidate,
                client_style: self.ctx.client_style,
                request: &self.request,
            };

            let started = tokio::time::Instant::now();
            match transport::execute_stream(&attempt_ctx).await {
                StreamAttempt::Failure(failure) => {
                    if !failure.no_key {
                        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                        engine
                            .record_sample(
                                &self.ctx,
                                &self.logical_id,
                                &provider_id,
                                config.transport,
                                true,
                                false,
                                latency_ms,
                            )
                            .await;
                        engine.note_failure(&self.ctx, &provider_id, &failure).await;
                    }
                    last_status = failure.status;
                    last_error = Some(failure.error_text.clone());
                    if failure.retryable && !is_last {
                        continue;
                    }
                    if failure.retryable {
                        // Exhausted below; fall through to the shared frame.
                        break;
                    }
                    self.emit_terminal_error(
                        &tx,
                        &format!(
                            "upstream error {}: {}",
                            failure
                                .status
                                .map(|status| status.to_string())
                                .unwrap_or_else(|| "-".to_string()),
                            failure.error_text
                        ),
                    )
                    .await;
                    return;
                }
                StreamAttempt::Started {
                    events,
                    upstream_style,
                    selection,
                } => {
                    let finished = self
                        .consume_stream(
                            &engine,
                            &runtime,
                            &config.transport,
                            candidate,
                            events,
                            upstream_style,
                            selection,
                            started,
                            &tx,
                        )
                        .await;
                    match finished {
                        StreamEnd::Delivered => return,
                        StreamEnd::RetryNext { status, error } => {
                            last_status = status;
                            last_error = Some(error);
                            if is_last {
                                break;
                            }
                        }
                    }
                }
            }
        }

        let detail =
            exhaustion_detail(&self.logical_id, skipped, last_status, last_error.as_deref());
        self.emit_terminal_error(&tx, &detail).await;
    }

    #[allow(clippy::too_many_arguments)]
    async fn consume_stream(
        &self,
        engine: &GatewayEngine,
        runtime: &Arc<ProviderRuntime>,
        transport_kind: &TransportKind,
        candidate: &CandidateScore,
        mut events: tokio::sync::mpsc::Receiver<Result<DecodedItem, StreamFault>>,
        upstream_style: ApiStyle,
        selection: SelectedKey,
        started: tokio::time::Instant,
        tx: &tokio::sync::mpsc::Sender<Bytes>,
    ) -> StreamEnd {
        let provider_id = candidate.upstream.provider_id.clone();
        let mut adapter = match StreamAdapter::new(
            upstream_style,
            self.ctx.client_style,
            &self.ctx.trace_id,
            &candidate.upstream.upstream_model_id,
            now_unix(),
        ) {
            Ok(adapter) => adapter,
            Err(err) => {
                return StreamEnd::RetryNext {
                    status: None,
                    error: err.to_string(),
                };
            }
        };

        let mut first_byte_seen = false;
        let mut first_byte_latency_ms = 0.0;
        let mut fault: Option<StreamFault> = None;

        while let Some(item) = events.recv().await {
            match item {
                Ok(DecodedItem::Event(event)) => {
                    if !first_byte_seen {
                        first_byte_seen = true;
                        first_byte_latency_ms = started.elapsed().as_secs_f64() * 1000.0;
                        engine.clear_failure(&provider_id).await;
                        let secret = self.state.gateway.load().secret_key.clone();
                        runtime
                            .pool
                            .record_success(&selection, self.state.cache.clone(), &secret)
                            .await;
                        engine.bind_session(&self.ctx, &self.logical_id, candidate).await;
                    }
                    let frames = match adapter.process(event) {
                        Ok(frames) => frames,
                        Err(err) => {
                            fault = Some(StreamFault {
                                status: None,
                                message: err.to_string(),
                            });
                            break;
                        }
                    };
                    for frame in frames {
                        let Some(encoded) = wire::encode_stream_event(&frame) else {
                            continue;
                        };
                        if tx.send(encoded).await.is_err() {
                            // Client went away: abort upstream, release key.
                            self.on_cancelled(engine, runtime, transport_kind, &provider_id, &selection)
                                .await;
                            return StreamEnd::Delivered;
                        }
                    }
                }
                Ok(DecodedItem::Done) => break,
                Err(stream_fault) => {
                    fault = Some(stream_fault);
                    break;
                }
            }
        }

        if let Some(fault) = fault {
            let latency_ms = if first_byte_seen {
                first_byte_latency_ms
            } else {
                started.elapsed().as_secs_f64() * 1000.0
            };
            engine
                .record_sample(
                    &self.ctx,
                    &self.logical_id,
                    &provider_id,
                    *transport_kind,
                    true,
                    false,
                    latency_ms,
                )
                .await;
            let retryable = fault
                .status
                .map(|status| (500..600).contains(&status) || status == 429 || status == 408)
                .unwrap_or(true);
            let secret = self.state.gateway.load().secret_key.clone();
            runtime
                .pool
                .record_failure(
                    &selection,
                    retryable,
                    fault.status,
                    self.state.cache.clone(),
                    &secret,
                )
                .await;
            if fault
                .status
                .is_some_and(|status| COOLDOWN_STATUSES.contains(&status))
            {
                engine.increment_failure(&provider_id).await;
            }

            if !first_byte_seen && retryable {
                // Nothing committed yet; the loop may try another provider.
                return StreamEnd::RetryNext {
                    status: fault.status,
                    error: fault.message,
                };
            }

            // Committed (or terminal): the failure goes in-band.
            for frame in adapter.fail(&fault.message) {
                if let Some(encoded) = wire::encode_stream_event(&frame)
                    && tx.send(encoded).await.is_err()
                {
                    break;
                }
            }
            self.save_stream_context(&serde_json::json!({
                "error": fault.message,
                "provider": provider_id,
            }))
            .await;
            return StreamEnd::Delivered;
        }

        // Clean completion: emit finalization frames, then the terminal
        // sentinel for chat.completions clients.
        for frame in adapter.finish() {
            if let Some(encoded) = wire::encode_stream_event(&frame)
                && tx.send(encoded).await.is_err()
            {
                self.on_cancelled(engine, runtime, transport_kind, &provider_id, &selection)
                    .await;
                return StreamEnd::Delivered;
            }
        }
        if self.ctx.client_style == ApiStyle::OpenAI && !adapter.errored() {
            let _ = tx.send(wire::encode_done_frame()).await;
        }

        engine
            .record_sample(
                &self.ctx,
                &self.logical_id,
                &provider_id,
                *transport_kind,
                true,
                true,
                first_byte_latency_ms,
            )
            .await;
        self.save_stream_context(&serde_json::json!({"stream": "completed"}))
            .await;
        StreamEnd::Delivered
    }

    async fn on_cancelled(
        &self,
        engine: &GatewayEngine,
        runtime: &Arc<ProviderRuntime>,
        transport_kind: &TransportKind,
        provider_id: &str,
        selection: &SelectedKey,
    ) {
        debug!(
            trace_id = %self.ctx.trace_id,
            provider = %provider_id,
            "client disconnected mid-stream"
        );
        let secret = self.state.gateway.load().secret_key.clone();
        runtime
            .pool
            .record_failure(selection, true, None, self.state.cache.clone(), &secret)
            .await;
        engine
            .record_sample(
                &self.ctx,
                &self.logical_id,
                provider_id,
                *transport_kind,
                true,
                false,
                0.0,
            )
            .await;
    }

    async fn emit_terminal_error(&self, tx: &tokio::sync::mpsc::Sender<Bytes>, message: &str) {
        // Same-style construction cannot fail.
        let Ok(mut adapter) = StreamAdapter::new(
            self.ctx.client_style,
            self.ctx.client_style,
            &self.ctx.trace_id,
            self.request.model(),
            now_unix(),
        ) else {
            return;
        };
        for frame in adapter.fail(message) {
            if let Some(encoded) = wire::encode_stream_event(&frame)
                && tx.send(encoded).await.is_err()
            {
                return;
            }
        }
        self.save_stream_context(&serde_json::json!({"error": message}))
            .await;
    }

    async fn save_stream_context(&self, response: &JsonValue) {
        let Some(session_id) = &self.ctx.session_id else {
            return;
        };
        let Ok(request_json) = self.request.to_json() else {
            return;
        };
        let ttl = Duration::from_secs(self.state.gateway.load().session_ttl_secs);
        session::save_context(&self.state.cache, session_id, &request_json, response, ttl).await;
    }
}

enum StreamEnd {
    /// Frames reached the client (or the client went away); stop the loop.
    Delivered,
    /// Nothing was committed; the next candidate may be tried.
    RetryNext {
        status: Option<u16>,
        error: String,
    },
}
