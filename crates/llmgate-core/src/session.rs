use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use llmgate_cache::{SharedCache, keys};

/// Conversation-level sticky binding to one upstream. Authoritative in the
/// shared cache so every replica sees the same binding; last writer wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionBinding {
    pub logical_model: String,
    pub provider_id: String,
    pub upstream_model_id: String,
    pub last_accessed: i64,
}

pub async fn load_binding(
    cache: &Arc<dyn SharedCache>,
    session_id: &str,
) -> Option<SessionBinding> {
    let key = keys::session_binding(session_id);
    match cache.get(&key).await {
        Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
        Ok(None) => None,
        Err(err) => {
            debug!(session = %session_id, error = %err, "session binding read failed");
            None
        }
    }
}

pub async fn store_binding(
    cache: &Arc<dyn SharedCache>,
    session_id: &str,
    binding: &SessionBinding,
    ttl: Duration,
) {
    let key = keys::session_binding(session_id);
    let Ok(raw) = serde_json::to_string(binding) else {
        return;
    };
    if let Err(err) = cache.set(&key, &raw, Some(ttl)).await {
        debug!(session = %session_id, error = %err, "session binding write skipped");
    }
}

/// Capped debug ring of request/response pairs for one conversation.
pub const CONTEXT_RING_CAP: usize = 50;

pub async fn save_context(
    cache: &Arc<dyn SharedCache>,
    session_id: &str,
    request: &serde_json::Value,
    response: &serde_json::Value,
    ttl: Duration,
) {
    let key = keys::session_history(session_id);
    let entry = serde_json::json!({ "request": request, "response": response });
    if let Err(err) = cache
        .list_push_capped(&key, &entry.to_string(), CONTEXT_RING_CAP, Some(ttl))
        .await
    {
        debug!(session = %session_id, error = %err, "context ring write skipped");
    }
}

pub async fn load_context(
    cache: &Arc<dyn SharedCache>,
    session_id: &str,
) -> Vec<serde_json::Value> {
    let key = keys::session_history(session_id);
    match cache.list_range(&key).await {
        Ok(entries) => entries
            .iter()
            .filter_map(|entry| serde_json::from_str(entry).ok())
            .collect(),
        Err(_) => Vec::new(),
    }
}
