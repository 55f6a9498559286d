use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::{Value as JsonValue, json};
use tokio::sync::Mutex;

use llmgate_cache::{MemoryCache, SharedCache, keys};
use llmgate_common::{GatewayConfig, MetricsSettings};
use llmgate_core::auth::AuthContext;
use llmgate_core::engine::{ChatCallContext, ChatOutcome, GatewayEngine};
use llmgate_core::state::AppState;
use llmgate_core::upstream_client::{
    TransportErrorKind, TransportFailure, UpstreamBody, UpstreamClient, UpstreamRequest,
    UpstreamResponse,
};
use llmgate_protocol::openai::chat_completions::request::{
    ChatCompletionRequest, ChatCompletionRequestBody,
};
use llmgate_protocol::openai::chat_completions::types::{
    ChatMessage, FunctionObject, TextContent, ToolDefinition, UserContent, UserMessage,
};
use llmgate_protocol::claude::messages::request::{CreateMessageRequest, CreateMessageRequestBody};
use llmgate_protocol::claude::messages::types::{
    MessageContent, MessageParam, MessageRole, SystemParam,
};
use llmgate_provider_core::{
    ApiKeyEntry, LogicalModel, MetricsBuffer, MetricsRecord, MetricsSink, ProviderConfig,
    SchedulingStrategy, SdkRegistry, TransportKind, Upstream,
};
use llmgate_transform::{ApiStyle, ChatRequest};

#[derive(Debug, Clone)]
enum Scripted {
    Json {
        status: u16,
        body: String,
    },
    /// SSE frames delivered in order; `fault_after` injects a transport
    /// drop once they are consumed.
    Stream {
        frames: Vec<String>,
        fault_after: Option<String>,
    },
}

#[derive(Default)]
struct ScriptedClient {
    script: Mutex<VecDeque<Scripted>>,
    calls: Mutex<Vec<UpstreamRequest>>,
}

impl ScriptedClient {
    async fn push(&self, item: Scripted) {
        self.script.lock().await.push_back(item);
    }

    async fn calls(&self) -> Vec<UpstreamRequest> {
        self.calls.lock().await.clone()
    }
}

impl UpstreamClient for ScriptedClient {
    fn send<'a>(
        &'a self,
        request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            self.calls.lock().await.push(request.clone());
            let Some(next) = self.script.lock().await.pop_front() else {
                return Ok(UpstreamResponse {
                    status: 500,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from_static(b"{\"error\":{\"message\":\"script exhausted\"}}")),
                });
            };
            match next {
                Scripted::Json { status, body } => Ok(UpstreamResponse {
                    status,
                    headers: Vec::new(),
                    body: UpstreamBody::Bytes(Bytes::from(body)),
                }),
                Scripted::Stream { frames, fault_after } => {
                    let (tx, rx) = tokio::sync::mpsc::channel(16);
                    tokio::spawn(async move {
                        for frame in frames {
                            if tx.send(Ok(Bytes::from(frame))).await.is_err() {
                                return;
                            }
                        }
                        if let Some(message) = fault_after {
                            let _ = tx
                                .send(Err(TransportFailure {
                                    kind: TransportErrorKind::Connect,
                                    message,
                                }))
                                .await;
                        }
                    });
                    Ok(UpstreamResponse {
                        status: 200,
                        headers: Vec::new(),
                        body: UpstreamBody::Stream(rx),
                    })
                }
            }
        })
    }
}

#[derive(Default)]
struct CapturingSink {
    records: std::sync::Mutex<Vec<MetricsRecord>>,
}

#[async_trait::async_trait]
impl MetricsSink for CapturingSink {
    async fn upsert(&self, records: Vec<MetricsRecord>) -> Result<(), String> {
        self.records.lock().unwrap().extend(records);
        Ok(())
    }
}

struct Harness {
    engine: GatewayEngine,
    client: Arc<ScriptedClient>,
    cache: Arc<dyn SharedCache>,
    metrics: Arc<MetricsBuffer>,
    sink: Arc<CapturingSink>,
    state: Arc<AppState>,
}

const SECRET: &str = "test-secret";

fn provider(id: &str, weight: f64) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        base_url: format!("https://{id}.test"),
        transport: TransportKind::Http,
        sdk_vendor: None,
        api_keys: vec![ApiKeyEntry {
            key: format!("sk-{id}-0001"),
            label: None,
            weight: 1.0,
            max_qps: None,
        }],
        supported_api_styles: Vec::new(),
        chat_completions_path: None,
        messages_path: None,
        responses_path: None,
        retryable_status_codes: Vec::new(),
        custom_headers: Default::default(),
        weight,
        max_qps: None,
        static_models: Vec::new(),
        model_aliases: Default::default(),
        enabled: true,
    }
}

fn logical_model(id: &str, providers: &[(&str, f64)]) -> LogicalModel {
    LogicalModel {
        logical_id: id.to_string(),
        capabilities: Vec::new(),
        upstreams: providers
            .iter()
            .map(|(provider, weight)| Upstream {
                provider_id: provider.to_string(),
                upstream_model_id: id.to_string(),
                endpoint: format!("https://{provider}.test/v1/chat/completions"),
                api_style: ApiStyle::OpenAI,
                base_weight: *weight,
                region: None,
                max_qps: None,
            })
            .collect(),
        enabled: true,
        updated_at: time::OffsetDateTime::UNIX_EPOCH,
    }
}

fn harness(providers: Vec<ProviderConfig>, models: Vec<LogicalModel>) -> Harness {
    let gateway = GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        secret_key: SECRET.to_string(),
        session_ttl_secs: 600,
        model_list_ttl_secs: 60,
        failure_cooldown_threshold: 3,
        failure_cooldown_secs: 30,
        metrics: MetricsSettings {
            buffered: true,
            ..Default::default()
        },
    };
    let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
    let sink = Arc::new(CapturingSink::default());
    let metrics = Arc::new(MetricsBuffer::new(gateway.metrics, sink.clone()));
    let state = Arc::new(AppState::new(
        gateway,
        providers,
        models,
        SchedulingStrategy::default(),
        Vec::new(),
        cache.clone(),
        metrics.clone(),
        Arc::new(SdkRegistry::new()),
    ));
    let client = Arc::new(ScriptedClient::default());
    let upstream: Arc<dyn UpstreamClient> = client.clone();
    Harness {
        engine: GatewayEngine::new(state.clone(), upstream),
        client,
        cache,
        metrics,
        sink,
        state,
    }
}

fn openai_request(model: &str, stream: bool) -> ChatRequest {
    let mut body = ChatCompletionRequestBody::bare(
        model,
        vec![ChatMessage::User(UserMessage {
            content: UserContent::Text("hi".to_string()),
            name: None,
        })],
    );
    if stream {
        body.stream = Some(true);
    }
    ChatRequest::OpenAI(ChatCompletionRequest { body })
}

fn call_ctx(session_id: Option<&str>, style: ApiStyle) -> ChatCallContext {
    ChatCallContext {
        trace_id: "trace-1".to_string(),
        auth: AuthContext {
            user_id: "u1".to_string(),
            key_label: "k1".to_string(),
            allowed_providers: None,
        },
        session_id: session_id.map(str::to_string),
        client_style: style,
    }
}

fn openai_success_body(id: &str, content: &str) -> String {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": 1_700_000_000,
        "model": "gpt-4",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop",
        }],
        "usage": {"prompt_tokens": 5, "completion_tokens": 2, "total_tokens": 7},
    })
    .to_string()
}

fn chunk_frame(content: &str) -> String {
    let data = json!({
        "id": "chatcmpl-s1",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "gpt-4",
        "choices": [{"index": 0, "delta": {"content": content}}],
    });
    format!("data: {data}\n\n")
}

async fn flush_and_records(harness: &Harness) -> Vec<MetricsRecord> {
    harness.metrics.flush().await;
    harness.sink.records.lock().unwrap().clone()
}

async fn collect_frames(body: &mut tokio::sync::mpsc::Receiver<Bytes>) -> Vec<String> {
    let mut out = Vec::new();
    while let Some(chunk) = body.recv().await {
        out.push(String::from_utf8(chunk.to_vec()).unwrap());
    }
    out
}

#[tokio::test]
async fn simple_success_routes_to_highest_weight() {
    let harness = harness(
        vec![provider("p1", 1.0), provider("p2", 0.5)],
        vec![logical_model("gpt-4", &[("p1", 1.0), ("p2", 0.5)])],
    );
    harness
        .client
        .push(Scripted::Json {
            status: 200,
            body: openai_success_body("chatcmpl-p1", "hello from p1"),
        })
        .await;

    let outcome = harness
        .engine
        .handle_chat(call_ctx(None, ApiStyle::OpenAI), openai_request("gpt-4", false))
        .await
        .unwrap();
    let ChatOutcome::Json(body) = outcome else {
        panic!("expected json outcome");
    };

    // Body passes through verbatim when the dialects already match.
    assert_eq!(body["id"], "chatcmpl-p1");
    assert_eq!(body["choices"][0]["message"]["content"], "hello from p1");

    let calls = harness.client.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].url, "https://p1.test/v1/chat/completions");
    assert!(
        calls[0]
            .headers
            .iter()
            .any(|(name, value)| name == "authorization" && value == "Bearer sk-p1-0001")
    );

    let records = flush_and_records(&harness).await;
    assert_eq!(records.len(), 1);
    let key = &records[0].key;
    assert_eq!(key.provider_id, "p1");
    assert_eq!(key.logical_model, "gpt-4");
    assert_eq!(key.transport, TransportKind::Http);
    assert!(!key.is_stream);
    assert_eq!(records[0].counters.success, 1);
}

#[tokio::test]
async fn retry_on_503_moves_to_next_candidate() {
    let harness = harness(
        vec![provider("p1", 1.0), provider("p2", 0.5)],
        vec![logical_model("gpt-4", &[("p1", 1.0), ("p2", 0.5)])],
    );
    harness
        .client
        .push(Scripted::Json {
            status: 503,
            body: json!({"error": {"message": "busy"}}).to_string(),
        })
        .await;
    harness
        .client
        .push(Scripted::Json {
            status: 200,
            body: openai_success_body("chatcmpl-p2", "hello from p2"),
        })
        .await;

    let outcome = harness
        .engine
        .handle_chat(call_ctx(None, ApiStyle::OpenAI), openai_request("gpt-4", false))
        .await
        .unwrap();
    let ChatOutcome::Json(body) = outcome else {
        panic!("expected json outcome");
    };
    assert_eq!(body["id"], "chatcmpl-p2");

    // P1 took a cooldown increment and a preference penalty.
    assert_eq!(
        harness
            .cache
            .get(&keys::provider_failures("p1"))
            .await
            .unwrap()
            .as_deref(),
        Some("1")
    );
    tokio::task::yield_now().await;
    let member = llmgate_provider_core::score_member(SECRET, "p1", "sk-p1-0001");
    let score = harness
        .cache
        .zscore(&keys::key_scores("p1"), &member)
        .await
        .unwrap()
        .unwrap();
    assert!(score < 1.0, "expected penalty, got {score}");

    let records = flush_and_records(&harness).await;
    let p1 = records.iter().find(|r| r.key.provider_id == "p1").unwrap();
    let p2 = records.iter().find(|r| r.key.provider_id == "p2").unwrap();
    assert_eq!(p1.counters.error, 1);
    assert_eq!(p2.counters.success, 1);
}

#[tokio::test]
async fn capability_mismatch_does_not_penalize() {
    let harness = harness(
        vec![provider("p1", 1.0), provider("p2", 0.5)],
        vec![logical_model("gpt-4", &[("p1", 1.0), ("p2", 0.5)])],
    );
    harness
        .client
        .push(Scripted::Json {
            status: 400,
            body: json!({"error": {"message": "This model does not support tools"}}).to_string(),
        })
        .await;
    harness
        .client
        .push(Scripted::Json {
            status: 200,
            body: openai_success_body("chatcmpl-p2", "done"),
        })
        .await;

    let mut body = ChatCompletionRequestBody::bare(
        "gpt-4",
        vec![ChatMessage::User(UserMessage {
            content: UserContent::Text("hi".to_string()),
            name: None,
        })],
    );
    body.tools = Some(vec![ToolDefinition::Function {
        function: FunctionObject {
            name: "lookup".to_string(),
            description: None,
            parameters: None,
            strict: None,
        },
    }]);
    let request = ChatRequest::OpenAI(ChatCompletionRequest { body });

    let outcome = harness
        .engine
        .handle_chat(call_ctx(None, ApiStyle::OpenAI), request)
        .await
        .unwrap();
    let ChatOutcome::Json(body) = outcome else {
        panic!("expected json outcome");
    };
    assert_eq!(body["id"], "chatcmpl-p2");

    // No cooldown and no preference penalty for the refusing provider.
    assert_eq!(
        harness
            .cache
            .get(&keys::provider_failures("p1"))
            .await
            .unwrap(),
        None
    );
    tokio::task::yield_now().await;
    let member = llmgate_provider_core::score_member(SECRET, "p1", "sk-p1-0001");
    let score = harness
        .cache
        .zscore(&keys::key_scores("p1"), &member)
        .await
        .unwrap();
    assert!(score.is_none_or(|score| score >= 1.0));
}

#[tokio::test]
async fn all_keys_in_backoff_yields_503() {
    let mut config = provider("p1", 1.0);
    config.api_keys.push(ApiKeyEntry {
        key: "sk-p1-0002".to_string(),
        label: None,
        weight: 1.0,
        max_qps: None,
    });
    let harness = harness(
        vec![config.clone()],
        vec![logical_model("gpt-4", &[("p1", 1.0)])],
    );

    // Both keys previously failed with 401 and sit in backoff.
    let runtime = harness.state.provider("p1").unwrap();
    for raw in ["sk-p1-0001", "sk-p1-0002"] {
        let selection = llmgate_provider_core::SelectedKey {
            provider_id: "p1".to_string(),
            key: raw.to_string(),
            label: raw.to_string(),
        };
        let _ = runtime
            .pool
            .acquire(&config, &harness.cache, SECRET)
            .await;
        runtime
            .pool
            .record_failure(&selection, false, Some(401), harness.cache.clone(), SECRET)
            .await;
    }

    let err = harness
        .engine
        .handle_chat(call_ctx(None, ApiStyle::OpenAI), openai_request("gpt-4", false))
        .await
        .unwrap_err();
    assert_eq!(err.status, 503);
    assert!(harness.client.calls().await.is_empty());
}

#[tokio::test]
async fn stream_error_after_commit_stays_on_candidate() {
    let harness = harness(
        vec![provider("p1", 1.0), provider("p2", 0.5)],
        vec![logical_model("gpt-4", &[("p1", 1.0), ("p2", 0.5)])],
    );
    harness
        .client
        .push(Scripted::Stream {
            frames: vec![chunk_frame("a"), chunk_frame("b"), chunk_frame("c")],
            fault_after: Some("connection reset".to_string()),
        })
        .await;

    let outcome = harness
        .engine
        .handle_chat(call_ctx(None, ApiStyle::OpenAI), openai_request("gpt-4", true))
        .await
        .unwrap();
    let ChatOutcome::Stream { mut body, .. } = outcome else {
        panic!("expected stream outcome");
    };
    let frames = collect_frames(&mut body).await;

    let contents: Vec<&String> = frames
        .iter()
        .filter(|frame| frame.contains("chat.completion.chunk"))
        .collect();
    assert_eq!(contents.len(), 3);
    let error_frames: Vec<&String> = frames
        .iter()
        .filter(|frame| frame.contains("upstream_error"))
        .collect();
    assert_eq!(error_frames.len(), 1);
    // The error frame is terminal: nothing follows it, in particular no [DONE].
    assert!(frames.last().unwrap().contains("upstream_error"));
    assert!(!frames.iter().any(|frame| frame.contains("[DONE]")));

    // P2 was never tried.
    assert_eq!(harness.client.calls().await.len(), 1);

    let records = flush_and_records(&harness).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key.provider_id, "p1");
    assert!(records[0].key.is_stream);
    assert_eq!(records[0].counters.error, 1);
}

#[tokio::test]
async fn stream_completes_with_single_done() {
    let harness = harness(
        vec![provider("p1", 1.0)],
        vec![logical_model("gpt-4", &[("p1", 1.0)])],
    );
    let finish = json!({
        "id": "chatcmpl-s1",
        "object": "chat.completion.chunk",
        "created": 1_700_000_000,
        "model": "gpt-4",
        "choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}],
    });
    harness
        .client
        .push(Scripted::Stream {
            frames: vec![
                chunk_frame("hel"),
                chunk_frame("lo"),
                format!("data: {finish}\n\n"),
                "data: [DONE]\n\n".to_string(),
            ],
            fault_after: None,
        })
        .await;

    let outcome = harness
        .engine
        .handle_chat(call_ctx(None, ApiStyle::OpenAI), openai_request("gpt-4", true))
        .await
        .unwrap();
    let ChatOutcome::Stream { mut body, .. } = outcome else {
        panic!("expected stream outcome");
    };
    let frames = collect_frames(&mut body).await;
    let done_count = frames.iter().filter(|frame| frame.contains("[DONE]")).count();
    assert_eq!(done_count, 1);
    assert_eq!(frames.last().unwrap(), "data: [DONE]\n\n");

    let records = flush_and_records(&harness).await;
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].counters.success, 1);
}

#[tokio::test]
async fn stream_failure_before_commit_retries_silently() {
    let harness = harness(
        vec![provider("p1", 1.0), provider("p2", 0.5)],
        vec![logical_model("gpt-4", &[("p1", 1.0), ("p2", 0.5)])],
    );
    harness
        .client
        .push(Scripted::Json {
            status: 503,
            body: json!({"error": {"message": "busy"}}).to_string(),
        })
        .await;
    harness
        .client
        .push(Scripted::Stream {
            frames: vec![chunk_frame("ok"), "data: [DONE]\n\n".to_string()],
            fault_after: None,
        })
        .await;

    let outcome = harness
        .engine
        .handle_chat(call_ctx(None, ApiStyle::OpenAI), openai_request("gpt-4", true))
        .await
        .unwrap();
    let ChatOutcome::Stream { mut body, .. } = outcome else {
        panic!("expected stream outcome");
    };
    let frames = collect_frames(&mut body).await;
    // The p1 failure is invisible to the client.
    assert!(!frames.iter().any(|frame| frame.contains("busy")));
    assert!(frames.iter().any(|frame| frame.contains("\"ok\"")));
    assert_eq!(harness.client.calls().await.len(), 2);
}

#[tokio::test]
async fn claude_client_over_openai_upstream_round_trips() {
    let harness = harness(
        vec![provider("p1", 1.0)],
        vec![logical_model("gpt-4", &[("p1", 1.0)])],
    );
    harness
        .client
        .push(Scripted::Json {
            status: 200,
            body: openai_success_body("chatcmpl-p1", "ok"),
        })
        .await;

    let request = ChatRequest::Claude(CreateMessageRequest {
        body: CreateMessageRequestBody {
            model: "gpt-4".to_string(),
            messages: vec![MessageParam {
                role: MessageRole::User,
                content: MessageContent::Text("hi".to_string()),
            }],
            max_tokens: 128,
            system: Some(SystemParam::Text("be terse".to_string())),
            stop_sequences: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            tools: None,
            tool_choice: None,
            metadata: None,
        },
    });

    let outcome = harness
        .engine
        .handle_chat(call_ctx(None, ApiStyle::Claude), request)
        .await
        .unwrap();
    let ChatOutcome::Json(body) = outcome else {
        panic!("expected json outcome");
    };

    // The upstream saw an OpenAI-shaped payload with the system prompt.
    let calls = harness.client.calls().await;
    let sent: JsonValue = serde_json::from_slice(calls[0].body.as_ref().unwrap()).unwrap();
    assert_eq!(sent["messages"][0]["role"], "system");
    assert_eq!(sent["messages"][0]["content"], "be terse");
    assert_eq!(sent["messages"][1]["role"], "user");
    assert_eq!(sent["messages"][1]["content"], "hi");

    // The client got a Claude-shaped message back.
    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["type"], "text");
    assert_eq!(body["content"][0]["text"], "ok");
    assert_eq!(body["stop_reason"], "end_turn");
    assert_eq!(body["usage"]["input_tokens"], 5);
    assert_eq!(body["usage"]["output_tokens"], 2);
}

#[tokio::test]
async fn session_binding_written_on_success() {
    let harness = harness(
        vec![provider("p1", 1.0)],
        vec![logical_model("gpt-4", &[("p1", 1.0)])],
    );
    harness
        .client
        .push(Scripted::Json {
            status: 200,
            body: openai_success_body("chatcmpl-p1", "hello"),
        })
        .await;

    harness
        .engine
        .handle_chat(
            call_ctx(Some("conv-1"), ApiStyle::OpenAI),
            openai_request("gpt-4", false),
        )
        .await
        .unwrap();

    let raw = harness
        .cache
        .get(&keys::session_binding("conv-1"))
        .await
        .unwrap()
        .expect("binding written");
    let binding: JsonValue = serde_json::from_str(&raw).unwrap();
    assert_eq!(binding["provider_id"], "p1");
    assert_eq!(binding["logical_model"], "gpt-4");

    // The conversation ring captured the exchange.
    let ring = harness.engine.context("conv-1").await;
    assert_eq!(ring.len(), 1);
    assert_eq!(ring[0]["request"]["model"], "gpt-4");
}

#[tokio::test]
async fn cooldown_threshold_skips_provider() {
    let harness = harness(
        vec![provider("p1", 1.0), provider("p2", 0.5)],
        vec![logical_model("gpt-4", &[("p1", 1.0), ("p2", 0.5)])],
    );
    // P1 sits over the failure threshold.
    for _ in 0..3 {
        harness
            .cache
            .incr(&keys::provider_failures("p1"), std::time::Duration::from_secs(30))
            .await
            .unwrap();
    }
    harness
        .client
        .push(Scripted::Json {
            status: 200,
            body: openai_success_body("chatcmpl-p2", "from p2"),
        })
        .await;

    let outcome = harness
        .engine
        .handle_chat(call_ctx(None, ApiStyle::OpenAI), openai_request("gpt-4", false))
        .await
        .unwrap();
    let ChatOutcome::Json(body) = outcome else {
        panic!("expected json outcome");
    };
    assert_eq!(body["id"], "chatcmpl-p2");
    let calls = harness.client.calls().await;
    assert_eq!(calls.len(), 1);
    assert!(calls[0].url.contains("p2.test"));
}

#[tokio::test]
async fn terminal_4xx_aborts_the_loop() {
    let harness = harness(
        vec![provider("p1", 1.0), provider("p2", 0.5)],
        vec![logical_model("gpt-4", &[("p1", 1.0), ("p2", 0.5)])],
    );
    harness
        .client
        .push(Scripted::Json {
            status: 400,
            body: json!({"error": {"message": "messages must not be empty"}}).to_string(),
        })
        .await;

    let err = harness
        .engine
        .handle_chat(call_ctx(None, ApiStyle::OpenAI), openai_request("gpt-4", false))
        .await
        .unwrap_err();
    assert_eq!(err.status, 502);
    assert!(err.message.contains("messages must not be empty"));
    // The second candidate was not consulted.
    assert_eq!(harness.client.calls().await.len(), 1);
}

#[tokio::test]
async fn claude_messages_path_miss_falls_back_to_chat_completions() {
    let mut config = provider("p1", 1.0);
    config.messages_path = Some("/v1/messages".to_string());
    let mut model = logical_model("claude-x", &[("p1", 1.0)]);
    model.upstreams[0].endpoint = "https://p1.test/v1/messages".to_string();
    model.upstreams[0].api_style = ApiStyle::Claude;
    let harness = harness(vec![config], vec![model]);

    harness
        .client
        .push(Scripted::Json {
            status: 404,
            body: json!({"detail": "Not Found"}).to_string(),
        })
        .await;
    harness
        .client
        .push(Scripted::Json {
            status: 200,
            body: openai_success_body("chatcmpl-fb", "fallback ok"),
        })
        .await;

    let request = ChatRequest::Claude(CreateMessageRequest {
        body: CreateMessageRequestBody {
            model: "claude-x".to_string(),
            messages: vec![MessageParam {
                role: MessageRole::User,
                content: MessageContent::Text("hi".to_string()),
            }],
            max_tokens: 64,
            system: None,
            stop_sequences: None,
            stream: None,
            temperature: None,
            top_p: None,
            top_k: None,
            tools: None,
            tool_choice: None,
            metadata: None,
        },
    });

    let outcome = harness
        .engine
        .handle_chat(call_ctx(None, ApiStyle::Claude), request)
        .await
        .unwrap();
    let ChatOutcome::Json(body) = outcome else {
        panic!("expected json outcome");
    };
    // Synthesized back into a Claude message for the client.
    assert_eq!(body["type"], "message");
    assert_eq!(body["content"][0]["text"], "fallback ok");

    let calls = harness.client.calls().await;
    assert_eq!(calls.len(), 2);
    assert!(calls[0].url.ends_with("/v1/messages"));
    assert!(calls[1].url.ends_with("/v1/chat/completions"));
}
