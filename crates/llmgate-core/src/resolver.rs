use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{debug, warn};

use llmgate_cache::keys;
use llmgate_protocol::openai::models::ModelList;
use llmgate_provider_core::{
    LogicalModel, ProviderConfig, SdkCallContext, TransportKind, Upstream,
};
use llmgate_transform::ApiStyle;

use crate::auth::AuthContext;
use crate::error::GatewayError;
use crate::state::AppState;
use crate::upstream_client::{
    HttpMethod, UpstreamBody, UpstreamClient, UpstreamRequest,
};

/// Endpoint preference per requested dialect: the client's own style first,
/// then the nearest compatible one.
fn style_priority(requested: ApiStyle) -> &'static [ApiStyle] {
    match requested {
        ApiStyle::Responses => &[ApiStyle::Responses, ApiStyle::OpenAI],
        ApiStyle::Claude => &[ApiStyle::Claude, ApiStyle::OpenAI],
        ApiStyle::OpenAI => &[ApiStyle::OpenAI, ApiStyle::Claude],
    }
}

/// Pick the upstream URL and dialect for one provider.
///
/// For SDK transport the endpoint is the base URL and the dialect is the
/// driver's; for the CLI transport it is always the messages path.
pub fn select_endpoint(
    state: &AppState,
    config: &ProviderConfig,
    requested_style: ApiStyle,
) -> Option<(String, ApiStyle)> {
    let base = config.base_url.trim_end_matches('/');
    match config.transport {
        TransportKind::Sdk => Some((base.to_string(), ApiStyle::OpenAI)),
        TransportKind::ClaudeCli => Some((
            state.cli_profile.messages_url(&config.base_url),
            ApiStyle::Claude,
        )),
        TransportKind::Http => {
            for style in style_priority(requested_style) {
                if !config.supports_style(*style) {
                    continue;
                }
                let Some(path) = config.path_for_style(*style) else {
                    continue;
                };
                return Some((format!("{base}{path}"), *style));
            }
            None
        }
    }
}

/// Resolve a caller-supplied model id to a logical model.
///
/// Static configuration wins; otherwise a synthetic logical model is built
/// from each accessible provider's advertised model list. Allowed-provider
/// filtering applies both before discovery and to the returned upstreams.
pub async fn resolve(
    state: &AppState,
    client: &Arc<dyn UpstreamClient>,
    lookup_id: &str,
    requested_style: ApiStyle,
    auth: &AuthContext,
) -> Result<LogicalModel, GatewayError> {
    if let Some(model) = state.logical_models.load().get(lookup_id) {
        if !model.enabled {
            return Err(GatewayError::model_not_available(lookup_id));
        }
        let upstreams: Vec<Upstream> = model
            .upstreams
            .iter()
            .filter(|upstream| auth.provider_allowed(&upstream.provider_id))
            .cloned()
            .collect();
        if upstreams.is_empty() {
            return Err(GatewayError::forbidden(format!(
                "no accessible provider serves model '{lookup_id}'"
            )));
        }
        let mut resolved = model.clone();
        resolved.upstreams = upstreams;
        return Ok(resolved);
    }

    discover(state, client, lookup_id, requested_style, auth).await
}

async fn discover(
    state: &AppState,
    client: &Arc<dyn UpstreamClient>,
    lookup_id: &str,
    requested_style: ApiStyle,
    auth: &AuthContext,
) -> Result<LogicalModel, GatewayError> {
    let providers: Vec<_> = state.providers.load().values().cloned().collect();
    let mut upstreams = Vec::new();

    for runtime in providers {
        let config = runtime.config.load_full();
        if !config.enabled || !auth.provider_allowed(&config.id) {
            continue;
        }
        let advertised = provider_models(state, client, &config).await;
        let Some(matched) = match_model(&config, &advertised, lookup_id) else {
            continue;
        };
        let Some((endpoint, api_style)) = select_endpoint(state, &config, requested_style) else {
            debug!(provider = %config.id, "no usable endpoint for requested style");
            continue;
        };
        upstreams.push(Upstream {
            provider_id: config.id.clone(),
            upstream_model_id: matched,
            endpoint,
            api_style,
            base_weight: config.weight,
            region: None,
            max_qps: config.max_qps,
        });
    }

    if upstreams.is_empty() {
        return Err(GatewayError::model_not_available(lookup_id));
    }

    // Deterministic candidate input order; the scheduler re-ranks anyway.
    upstreams.sort_by(|a, b| a.provider_id.cmp(&b.provider_id));
    Ok(LogicalModel {
        logical_id: lookup_id.to_string(),
        capabilities: Vec::new(),
        upstreams,
        enabled: true,
        updated_at: OffsetDateTime::now_utc(),
    })
}

/// A provider contributes a model when the advertised id matches exactly,
/// as a `provider/model` path suffix, or through the alias table.
fn match_model(config: &ProviderConfig, advertised: &[String], lookup_id: &str) -> Option<String> {
    if let Some(target) = config.resolve_alias(lookup_id)
        && advertised.iter().any(|id| id == target)
    {
        return Some(target.to_string());
    }
    let suffix = format!("/{lookup_id}");
    advertised
        .iter()
        .find(|id| id.as_str() == lookup_id || id.ends_with(&suffix))
        .cloned()
}

/// Advertised model ids for one provider: static config, else the cached
/// `/models` list, refreshed on miss.
pub async fn provider_models(
    state: &AppState,
    client: &Arc<dyn UpstreamClient>,
    config: &ProviderConfig,
) -> Vec<String> {
    if !config.static_models.is_empty() {
        return config.static_models.clone();
    }

    let cache_key = keys::vendor_models(&config.id);
    if let Ok(Some(raw)) = state.cache.get(&cache_key).await
        && let Ok(ids) = serde_json::from_str::<Vec<String>>(&raw)
    {
        return ids;
    }

    let ids = match fetch_models(state, client, config).await {
        Ok(ids) => ids,
        Err(err) => {
            warn!(provider = %config.id, error = %err, "model list fetch failed");
            return Vec::new();
        }
    };

    let ttl = Duration::from_secs(state.gateway.load().model_list_ttl_secs);
    if let Ok(raw) = serde_json::to_string(&ids)
        && let Err(err) = state.cache.set(&cache_key, &raw, Some(ttl)).await
    {
        debug!(provider = %config.id, error = %err, "model list cache write skipped");
    }
    ids
}

async fn fetch_models(
    state: &AppState,
    client: &Arc<dyn UpstreamClient>,
    config: &ProviderConfig,
) -> Result<Vec<String>, GatewayError> {
    // Discovery bypasses the pool: it is low-volume and must not consume
    // QPS budget or skew preference scores.
    let api_key = config
        .api_keys
        .first()
        .map(|entry| entry.key.clone())
        .unwrap_or_default();

    match config.transport {
        TransportKind::Sdk => {
            let vendor = config.sdk_vendor.as_deref().unwrap_or_default();
            let driver = state
                .sdk
                .get(vendor)
                .map_err(|err| GatewayError::internal(err.to_string()))?;
            let ctx = SdkCallContext {
                provider_id: config.id.clone(),
                base_url: config.base_url.clone(),
                api_key,
                upstream_model: String::new(),
            };
            driver
                .list_models(&ctx)
                .await
                .map_err(|err| GatewayError::upstream_failed(err.to_string()))
        }
        TransportKind::Http | TransportKind::ClaudeCli => {
            let url = format!("{}/v1/models", config.base_url.trim_end_matches('/'));
            let mut headers = vec![("accept".to_string(), "application/json".to_string())];
            if !api_key.is_empty() {
                headers.push(("authorization".to_string(), format!("Bearer {api_key}")));
            }
            for (name, value) in &config.custom_headers {
                headers.push((name.clone(), value.clone()));
            }
            let response = client
                .send(UpstreamRequest {
                    method: HttpMethod::Get,
                    url,
                    headers,
                    body: None,
                    is_stream: false,
                })
                .await
                .map_err(|err| GatewayError::upstream_failed(err.to_string()))?;
            let UpstreamBody::Bytes(body) = response.body else {
                return Err(GatewayError::upstream_failed("unexpected streaming body"));
            };
            if !(200..300).contains(&response.status) {
                return Err(GatewayError::upstream_failed(format!(
                    "model list fetch returned {}",
                    response.status
                )));
            }
            let list: ModelList = serde_json::from_slice(&body)
                .map_err(|err| GatewayError::upstream_failed(format!("invalid model list: {err}")))?;
            Ok(list.data.into_iter().map(|entry| entry.id).collect())
        }
    }
}
