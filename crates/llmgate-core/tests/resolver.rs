use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use serde_json::json;
use tokio::sync::Mutex;

use llmgate_cache::{MemoryCache, SharedCache};
use llmgate_common::{GatewayConfig, MetricsSettings};
use llmgate_core::auth::AuthContext;
use llmgate_core::resolver;
use llmgate_core::state::AppState;
use llmgate_core::upstream_client::{
    TransportFailure, UpstreamBody, UpstreamClient, UpstreamRequest, UpstreamResponse,
};
use llmgate_provider_core::{
    ApiKeyEntry, LogicalModel, MetricsBuffer, ProviderConfig, SchedulingStrategy, SdkRegistry,
    TracingMetricsSink, TransportKind, Upstream,
};
use llmgate_transform::ApiStyle;

/// Replays one JSON body per call and counts calls.
#[derive(Default)]
struct ModelListClient {
    bodies: Mutex<VecDeque<String>>,
    calls: std::sync::atomic::AtomicUsize,
}

impl UpstreamClient for ModelListClient {
    fn send<'a>(
        &'a self,
        _request: UpstreamRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportFailure>> + Send + 'a>>
    {
        Box::pin(async move {
            self.calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let body = self
                .bodies
                .lock()
                .await
                .pop_front()
                .unwrap_or_else(|| json!({"object": "list", "data": []}).to_string());
            Ok(UpstreamResponse {
                status: 200,
                headers: Vec::new(),
                body: UpstreamBody::Bytes(Bytes::from(body)),
            })
        })
    }
}

fn provider(id: &str) -> ProviderConfig {
    ProviderConfig {
        id: id.to_string(),
        base_url: format!("https://{id}.test"),
        transport: TransportKind::Http,
        sdk_vendor: None,
        api_keys: vec![ApiKeyEntry {
            key: format!("sk-{id}"),
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
        weight: 1.0,
        max_qps: None,
        static_models: Vec::new(),
        model_aliases: Default::default(),
        enabled: true,
    }
}

fn state_with(providers: Vec<ProviderConfig>, models: Vec<LogicalModel>) -> Arc<AppState> {
    let gateway = GatewayConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        secret_key: "test-secret".to_string(),
        session_ttl_secs: 600,
        model_list_ttl_secs: 60,
        failure_cooldown_threshold: 3,
        failure_cooldown_secs: 30,
        metrics: MetricsSettings::default(),
    };
    let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
    let metrics = Arc::new(MetricsBuffer::new(
        gateway.metrics,
        Arc::new(TracingMetricsSink),
    ));
    Arc::new(AppState::new(
        gateway,
        providers,
        models,
        SchedulingStrategy::default(),
        Vec::new(),
        cache,
        metrics,
        Arc::new(SdkRegistry::new()),
    ))
}

fn unrestricted() -> AuthContext {
    AuthContext {
        user_id: "u1".to_string(),
        key_label: "k1".to_string(),
        allowed_providers: None,
    }
}

fn restricted(providers: &[&str]) -> AuthContext {
    AuthContext {
        user_id: "u1".to_string(),
        key_label: "k1".to_string(),
        allowed_providers: Some(providers.iter().map(|p| p.to_string()).collect()),
    }
}

fn client() -> (Arc<ModelListClient>, Arc<dyn UpstreamClient>) {
    let scripted = Arc::new(ModelListClient::default());
    let dynamic: Arc<dyn UpstreamClient> = scripted.clone();
    (scripted, dynamic)
}

#[tokio::test]
async fn static_logical_model_wins_and_filters_providers() {
    let model = LogicalModel {
        logical_id: "gpt-4".to_string(),
        capabilities: Vec::new(),
        upstreams: vec![
            Upstream {
                provider_id: "p1".to_string(),
                upstream_model_id: "gpt-4-a".to_string(),
                endpoint: "https://p1.test/v1/chat/completions".to_string(),
                api_style: ApiStyle::OpenAI,
                base_weight: 1.0,
                region: None,
                max_qps: None,
            },
            Upstream {
                provider_id: "p2".to_string(),
                upstream_model_id: "gpt-4-b".to_string(),
                endpoint: "https://p2.test/v1/chat/completions".to_string(),
                api_style: ApiStyle::OpenAI,
                base_weight: 0.5,
                region: None,
                max_qps: None,
            },
        ],
        enabled: true,
        updated_at: time::OffsetDateTime::UNIX_EPOCH,
    };
    let state = state_with(vec![provider("p1"), provider("p2")], vec![model]);
    let (_, dynamic) = client();

    let resolved = resolver::resolve(
        &state,
        &dynamic,
        "gpt-4",
        ApiStyle::OpenAI,
        &restricted(&["p2"]),
    )
    .await
    .unwrap();
    assert_eq!(resolved.upstreams.len(), 1);
    assert_eq!(resolved.upstreams[0].provider_id, "p2");

    let err = resolver::resolve(
        &state,
        &dynamic,
        "gpt-4",
        ApiStyle::OpenAI,
        &restricted(&["p9"]),
    )
    .await
    .unwrap_err();
    assert_eq!(err.status, 403);
}

#[tokio::test]
async fn unknown_model_is_a_client_error() {
    let state = state_with(vec![], vec![]);
    let (_, dynamic) = client();
    let err = resolver::resolve(&state, &dynamic, "nope", ApiStyle::OpenAI, &unrestricted())
        .await
        .unwrap_err();
    assert_eq!(err.status, 400);
    assert!(err.message.contains("nope"));
}

#[tokio::test]
async fn discovery_matches_exact_suffix_and_alias() {
    let mut p1 = provider("p1");
    p1.static_models = vec!["openai/gpt-9".to_string()];
    let mut p2 = provider("p2");
    p2.static_models = vec!["gpt-9".to_string()];
    let mut p3 = provider("p3");
    p3.static_models = vec!["internal-123".to_string()];
    p3.model_aliases
        .insert("gpt-9".to_string(), "internal-123".to_string());
    let state = state_with(vec![p1, p2, p3], vec![]);
    let (_, dynamic) = client();

    let resolved = resolver::resolve(&state, &dynamic, "gpt-9", ApiStyle::OpenAI, &unrestricted())
        .await
        .unwrap();
    let mut pairs: Vec<(String, String)> = resolved
        .upstreams
        .iter()
        .map(|u| (u.provider_id.clone(), u.upstream_model_id.clone()))
        .collect();
    pairs.sort();
    assert_eq!(
        pairs,
        vec![
            ("p1".to_string(), "openai/gpt-9".to_string()),
            ("p2".to_string(), "gpt-9".to_string()),
            ("p3".to_string(), "internal-123".to_string()),
        ]
    );
}

#[tokio::test]
async fn discovery_honors_allowed_providers_before_fetch() {
    let state = state_with(vec![provider("p1"), provider("p2")], vec![]);
    let (scripted, dynamic) = client();
    scripted
        .bodies
        .lock()
        .await
        .push_back(json!({"object": "list", "data": [{"id": "m1", "object": "model"}]}).to_string());

    let resolved = resolver::resolve(&state, &dynamic, "m1", ApiStyle::OpenAI, &restricted(&["p1"]))
        .await
        .unwrap();
    assert_eq!(resolved.upstreams.len(), 1);
    // Only the accessible provider's model list was fetched.
    assert_eq!(scripted.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn model_lists_are_cached_between_resolves() {
    let state = state_with(vec![provider("p1")], vec![]);
    let (scripted, dynamic) = client();
    scripted
        .bodies
        .lock()
        .await
        .push_back(json!({"object": "list", "data": [{"id": "m1", "object": "model"}]}).to_string());

    for _ in 0..3 {
        resolver::resolve(&state, &dynamic, "m1", ApiStyle::OpenAI, &unrestricted())
            .await
            .unwrap();
    }
    assert_eq!(scripted.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
}

#[tokio::test]
async fn endpoint_selection_prefers_the_client_dialect() {
    let mut config = provider("p1");
    config.messages_path = Some("/v1/messages".to_string());
    config.responses_path = Some("/v1/responses".to_string());
    let state = state_with(vec![config.clone()], vec![]);

    let (url, style) = resolver::select_endpoint(&state, &config, ApiStyle::Claude).unwrap();
    assert_eq!(url, "https://p1.test/v1/messages");
    assert_eq!(style, ApiStyle::Claude);

    let (url, style) = resolver::select_endpoint(&state, &config, ApiStyle::Responses).unwrap();
    assert_eq!(url, "https://p1.test/v1/responses");
    assert_eq!(style, ApiStyle::Responses);

    let (url, style) = resolver::select_endpoint(&state, &config, ApiStyle::OpenAI).unwrap();
    assert_eq!(url, "https://p1.test/v1/chat/completions");
    assert_eq!(style, ApiStyle::OpenAI);

    // Declared styles are authoritative: without openai in the list, an
    // openai client falls through to the claude endpoint.
    let mut declared = config.clone();
    declared.supported_api_styles = vec![ApiStyle::Claude];
    let (url, style) = resolver::select_endpoint(&state, &declared, ApiStyle::OpenAI).unwrap();
    assert_eq!(url, "https://p1.test/v1/messages");
    assert_eq!(style, ApiStyle::Claude);
}
