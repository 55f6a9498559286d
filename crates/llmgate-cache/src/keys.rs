//! Canonical cache key layout. Every key the gateway touches is built here.

/// Capped list of `{request, response}` debug entries for one conversation.
pub fn session_history(conversation_id: &str) -> String {
    format!("session:{conversation_id}:history")
}

/// JSON session sticky binding.
pub fn session_binding(conversation_id: &str) -> String {
    format!("session:{conversation_id}:binding")
}

/// Cached `/models` list for one provider, JSON array of model ids.
pub fn vendor_models(provider_id: &str) -> String {
    format!("llm:vendor:{provider_id}:models")
}

/// Sorted set of per-key preference scores. Members are HMAC-SHA256 digests
/// of `{provider}:{raw_key}`; raw keys never appear here.
pub fn key_scores(provider_id: &str) -> String {
    format!("provider:{provider_id}:key_scores")
}

/// One-second QPS bucket for a single (masked) key label.
pub fn key_qps(provider_id: &str, label: &str, epoch_sec: i64) -> String {
    format!("provider:{provider_id}:key:{label}:qps:{epoch_sec}")
}

/// Short-lived provider failure counter backing the candidate cooldown.
pub fn provider_failures(provider_id: &str) -> String {
    format!("provider:{provider_id}:failures")
}

/// Aggregated model list served from `/v1/models`.
pub fn models_all() -> String {
    "gateway:models:all".to_string()
}

/// Per-logical-model routing metrics snapshot for one provider.
pub fn routing_metrics(logical_model: &str, provider_id: &str) -> String {
    format!("metrics:routing:{logical_model}:{provider_id}")
}

/// Per-provider dynamic weight override.
pub fn dynamic_weight(provider_id: &str) -> String {
    format!("provider:{provider_id}:dynamic_weight")
}
