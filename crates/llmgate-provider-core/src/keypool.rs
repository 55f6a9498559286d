use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use rand::distr::Distribution;
use rand::distr::weighted::WeightedIndex;
use sha2::Sha256;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use llmgate_cache::{SharedCache, keys};

use crate::config::ProviderConfig;
use crate::errors::ProviderError;

pub const PREFERENCE_BASE: f64 = 1.0;
const PREFERENCE_MIN: f64 = 0.1;
const PREFERENCE_MAX: f64 = 10.0;
const PREFERENCE_SUCCESS_DELTA: f64 = 0.5;
const PREFERENCE_RETRYABLE_FAILURE_DELTA: f64 = -1.0;
const PREFERENCE_FATAL_DELTA: f64 = -2.0;
const PREFERENCE_AUTH_FAILURE_DELTA: f64 = -3.0;
const PREFERENCE_BAND_TOLERANCE: f64 = 0.05;
const MAX_BACKOFF_SECS: f64 = 60.0;
const AUTH_MIN_BACKOFF_SECS: f64 = 30.0;

#[derive(Debug, Clone)]
struct KeyState {
    raw_key: String,
    label: String,
    weight: f64,
    max_qps: Option<u32>,
    fail_count: u32,
    backoff_until: Option<Instant>,
    last_used_at: Option<Instant>,
}

/// The chosen key for one upstream call. Carries the raw key for the
/// transport plus the masked label for logs.
#[derive(Debug, Clone)]
pub struct SelectedKey {
    pub provider_id: String,
    pub key: String,
    pub label: String,
}

/// Per-provider weighted API key selection with failure backoff.
///
/// Preference scores are authoritative in the shared cache (HMAC members,
/// shared across replicas); backoff and fail counts are process-local.
pub struct KeyPool {
    provider_id: String,
    states: Mutex<HashMap<String, KeyState>>,
}

/// Sorted-set member for one key: HMAC-SHA256 of `{provider}:{raw_key}`
/// under the gateway secret. Raw keys are never written to the cache.
pub fn score_member(secret: &str, provider_id: &str, raw_key: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(provider_id.as_bytes());
    mac.update(b":");
    mac.update(raw_key.as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn mask_label(raw_key: &str, explicit: Option<&str>, index: usize) -> String {
    if let Some(label) = explicit.map(str::trim).filter(|label| !label.is_empty()) {
        return label.to_string();
    }
    let tail: String = raw_key
        .chars()
        .rev()
        .take(4)
        .collect::<Vec<char>>()
        .into_iter()
        .rev()
        .collect();
    let tail = if tail.is_empty() { "xxxx" } else { &tail };
    format!("key{}-***{tail}", index + 1)
}

impl KeyPool {
    pub fn new(provider_id: impl Into<String>) -> Self {
        Self {
            provider_id: provider_id.into(),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Choose an available key using banded preference scores and weighted
    /// random selection. Keys in backoff or over their per-key QPS budget
    /// are skipped.
    pub async fn acquire(
        &self,
        config: &ProviderConfig,
        cache: &Arc<dyn SharedCache>,
        secret: &str,
    ) -> Result<SelectedKey, ProviderError> {
        let mut states = self.states.lock().await;
        self.reconcile(&mut states, config)?;

        let now = Instant::now();
        let mut candidates: Vec<KeyState> = states
            .values()
            .filter(|state| state.backoff_until.is_none_or(|until| until <= now))
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Err(ProviderError::NoAvailableKey {
                provider: self.provider_id.clone(),
                reason: "all keys in backoff".to_string(),
            });
        }

        let scores = self.load_preference_scores(cache, secret, &candidates).await;
        candidates.sort_by(|a, b| {
            let score_a = scores.get(&a.raw_key).copied().unwrap_or(PREFERENCE_BASE);
            let score_b = scores.get(&b.raw_key).copied().unwrap_or(PREFERENCE_BASE);
            score_b
                .partial_cmp(&score_a)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.label.cmp(&b.label))
        });

        let mut index = 0;
        while index < candidates.len() {
            let band_floor = scores
                .get(&candidates[index].raw_key)
                .copied()
                .unwrap_or(PREFERENCE_BASE)
                - PREFERENCE_BAND_TOLERANCE;
            let mut band: Vec<KeyState> = Vec::new();
            while index < candidates.len() {
                let score = scores
                    .get(&candidates[index].raw_key)
                    .copied()
                    .unwrap_or(PREFERENCE_BASE);
                if score < band_floor {
                    break;
                }
                band.push(candidates[index].clone());
                index += 1;
            }

            while !band.is_empty() {
                let chosen = weighted_pick(&band);
                let state = band.swap_remove(chosen);
                if !self.reserve_qps(cache, &state).await {
                    debug!(
                        provider = %self.provider_id,
                        key = %state.label,
                        "per-key qps budget exhausted for this second"
                    );
                    continue;
                }
                if let Some(live) = states.get_mut(&state.raw_key) {
                    live.last_used_at = Some(now);
                }
                return Ok(SelectedKey {
                    provider_id: self.provider_id.clone(),
                    key: state.raw_key,
                    label: state.label,
                });
            }
        }

        Err(ProviderError::NoAvailableKey {
            provider: self.provider_id.clone(),
            reason: "rate limited".to_string(),
        })
    }

    /// Reset failure state and nudge the preference score upward.
    pub async fn record_success(
        &self,
        selection: &SelectedKey,
        cache: Arc<dyn SharedCache>,
        secret: &str,
    ) {
        {
            let mut states = self.states.lock().await;
            if let Some(state) = states.get_mut(&selection.key) {
                state.fail_count = 0;
                state.backoff_until = None;
            }
        }
        self.spawn_score_adjustment(selection, cache, secret, PREFERENCE_SUCCESS_DELTA);
    }

    /// Apply exponential backoff and a negative score delta after a failed
    /// upstream call. 401/403 clamp the backoff to at least 30 seconds and
    /// use the larger auth penalty.
    pub async fn record_failure(
        &self,
        selection: &SelectedKey,
        retryable: bool,
        status: Option<u16>,
        cache: Arc<dyn SharedCache>,
        secret: &str,
    ) {
        let backoff_secs;
        {
            let mut states = self.states.lock().await;
            let Some(state) = states.get_mut(&selection.key) else {
                return;
            };
            state.fail_count += 1;
            let base = if retryable { 1.0 } else { 5.0 };
            let mut backoff = base * f64::from(1u32 << state.fail_count.min(5));
            let mut delta = if retryable {
                PREFERENCE_RETRYABLE_FAILURE_DELTA
            } else {
                PREFERENCE_FATAL_DELTA
            };
            if matches!(status, Some(401) | Some(403)) {
                backoff = backoff.max(AUTH_MIN_BACKOFF_SECS);
                delta = delta.min(PREFERENCE_AUTH_FAILURE_DELTA);
            }
            backoff_secs = backoff.min(MAX_BACKOFF_SECS);
            state.backoff_until = Some(Instant::now() + Duration::from_secs_f64(backoff_secs));
            self.spawn_score_adjustment(selection, cache, secret, delta);
        }
        warn!(
            provider = %selection.provider_id,
            key = %selection.label,
            backoff_secs,
            status = ?status,
            retryable,
            "api key entering backoff"
        );
    }

    /// Whether every configured key is currently in backoff.
    pub async fn all_in_backoff(&self, config: &ProviderConfig) -> bool {
        let mut states = self.states.lock().await;
        if self.reconcile(&mut states, config).is_err() {
            return true;
        }
        let now = Instant::now();
        states
            .values()
            .all(|state| state.backoff_until.is_some_and(|until| until > now))
    }

    /// Sync in-process state with the configured key list: add new keys,
    /// refresh metadata, drop removed entries (backoff state survives for
    /// keys that stay).
    fn reconcile(
        &self,
        states: &mut HashMap<String, KeyState>,
        config: &ProviderConfig,
    ) -> Result<(), ProviderError> {
        if config.api_keys.is_empty() {
            return Err(ProviderError::NoAvailableKey {
                provider: self.provider_id.clone(),
                reason: "no configured keys".to_string(),
            });
        }
        for (index, entry) in config.api_keys.iter().enumerate() {
            let label = mask_label(&entry.key, entry.label.as_deref(), index);
            states
                .entry(entry.key.clone())
                .and_modify(|state| {
                    state.label = label.clone();
                    state.weight = entry.weight;
                    state.max_qps = entry.max_qps;
                })
                .or_insert_with(|| KeyState {
                    raw_key: entry.key.clone(),
                    label,
                    weight: entry.weight,
                    max_qps: entry.max_qps,
                    fail_count: 0,
                    backoff_until: None,
                    last_used_at: None,
                });
        }
        states.retain(|raw_key, _| config.api_keys.iter().any(|entry| entry.key == *raw_key));
        Ok(())
    }

    async fn load_preference_scores(
        &self,
        cache: &Arc<dyn SharedCache>,
        secret: &str,
        candidates: &[KeyState],
    ) -> HashMap<String, f64> {
        let zset_key = keys::key_scores(&self.provider_id);
        let mut scores = HashMap::new();
        for state in candidates {
            let member = score_member(secret, &self.provider_id, &state.raw_key);
            if cache
                .zadd_if_absent(&zset_key, &member, PREFERENCE_BASE)
                .await
                .is_err()
            {
                // Cache unavailable: run with flat preferences.
                return HashMap::new();
            }
            match cache.zscore(&zset_key, &member).await {
                Ok(Some(score)) => {
                    scores.insert(state.raw_key.clone(), score);
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(provider = %self.provider_id, error = %err, "preference score lookup failed");
                    return HashMap::new();
                }
            }
        }
        scores
    }

    async fn reserve_qps(&self, cache: &Arc<dyn SharedCache>, state: &KeyState) -> bool {
        let Some(max_qps) = state.max_qps else {
            return true;
        };
        let epoch_sec = time::OffsetDateTime::now_utc().unix_timestamp();
        let bucket = keys::key_qps(&self.provider_id, &state.label, epoch_sec);
        match cache.incr(&bucket, Duration::from_secs(1)).await {
            Ok(count) => count <= i64::from(max_qps),
            // Cache down: let the call through rather than refuse traffic.
            Err(_) => true,
        }
    }

    fn spawn_score_adjustment(
        &self,
        selection: &SelectedKey,
        cache: Arc<dyn SharedCache>,
        secret: &str,
        delta: f64,
    ) {
        let zset_key = keys::key_scores(&selection.provider_id);
        let member = score_member(secret, &selection.provider_id, &selection.key);
        let provider = selection.provider_id.clone();
        tokio::spawn(async move {
            if cache
                .zadd_if_absent(&zset_key, &member, PREFERENCE_BASE)
                .await
                .is_err()
            {
                return;
            }
            if let Err(err) = cache
                .zincr_clamped(&zset_key, &member, delta, PREFERENCE_MIN, PREFERENCE_MAX)
                .await
            {
                debug!(provider = %provider, error = %err, "preference score update skipped");
            }
        });
    }
}

fn weighted_pick(band: &[KeyState]) -> usize {
    let weights: Vec<f64> = band.iter().map(|state| state.weight.max(0.0001)).collect();
    match WeightedIndex::new(&weights) {
        Ok(distribution) => distribution.sample(&mut rand::rng()),
        Err(_) => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ApiKeyEntry, TransportKind};
    use llmgate_cache::MemoryCache;

    fn provider_with_keys(entries: Vec<ApiKeyEntry>) -> ProviderConfig {
        ProviderConfig {
            id: "p1".to_string(),
            base_url: "https://api.example.com".to_string(),
            transport: TransportKind::Http,
            sdk_vendor: None,
            api_keys: entries,
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

    fn key(raw: &str) -> ApiKeyEntry {
        ApiKeyEntry {
            key: raw.to_string(),
            label: None,
            weight: 1.0,
            max_qps: None,
        }
    }

    fn cache() -> Arc<dyn SharedCache> {
        Arc::new(MemoryCache::new())
    }

    #[tokio::test]
    async fn acquire_picks_a_configured_key() {
        let pool = KeyPool::new("p1");
        let config = provider_with_keys(vec![key("sk-alpha-1234")]);
        let selected = pool.acquire(&config, &cache(), "secret").await.unwrap();
        assert_eq!(selected.key, "sk-alpha-1234");
        assert_eq!(selected.label, "key1-***1234");
    }

    #[tokio::test]
    async fn backoff_excludes_key_until_expiry() {
        let pool = KeyPool::new("p1");
        let config = provider_with_keys(vec![key("sk-a"), key("sk-b")]);
        let cache = cache();
        let selected = pool.acquire(&config, &cache, "secret").await.unwrap();
        pool.record_failure(&selected, true, Some(503), cache.clone(), "secret")
            .await;
        for _ in 0..8 {
            let next = pool.acquire(&config, &cache, "secret").await.unwrap();
            assert_ne!(next.key, selected.key);
        }
    }

    #[tokio::test]
    async fn all_keys_in_backoff_fails_acquire() {
        let pool = KeyPool::new("p1");
        let config = provider_with_keys(vec![key("sk-a"), key("sk-b")]);
        let cache = cache();
        for raw in ["sk-a", "sk-b"] {
            let selection = SelectedKey {
                provider_id: "p1".to_string(),
                key: raw.to_string(),
                label: raw.to_string(),
            };
            // Seed the state table, then fail with 401.
            let _ = pool.acquire(&config, &cache, "secret").await.unwrap();
            pool.record_failure(&selection, false, Some(401), cache.clone(), "secret")
                .await;
        }
        let err = pool.acquire(&config, &cache, "secret").await.unwrap_err();
        assert!(matches!(
            err,
            ProviderError::NoAvailableKey { reason, .. } if reason == "all keys in backoff"
        ));
        assert!(pool.all_in_backoff(&config).await);
    }

    #[tokio::test]
    async fn removed_keys_are_dropped_on_reconcile() {
        let pool = KeyPool::new("p1");
        let cache = cache();
        let config = provider_with_keys(vec![key("sk-old")]);
        pool.acquire(&config, &cache, "secret").await.unwrap();

        let config = provider_with_keys(vec![key("sk-new")]);
        let selected = pool.acquire(&config, &cache, "secret").await.unwrap();
        assert_eq!(selected.key, "sk-new");
    }

    #[tokio::test]
    async fn success_resets_backoff() {
        let pool = KeyPool::new("p1");
        let config = provider_with_keys(vec![key("sk-a")]);
        let cache = cache();
        let selected = pool.acquire(&config, &cache, "secret").await.unwrap();
        pool.record_failure(&selected, true, Some(503), cache.clone(), "secret")
            .await;
        pool.record_success(&selected, cache.clone(), "secret").await;
        let again = pool.acquire(&config, &cache, "secret").await.unwrap();
        assert_eq!(again.key, "sk-a");
    }

    #[tokio::test]
    async fn raw_keys_never_reach_the_cache() {
        let pool = KeyPool::new("p1");
        let config = provider_with_keys(vec![key("sk-secret-raw")]);
        let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
        let selected = pool.acquire(&config, &cache, "secret").await.unwrap();
        pool.record_success(&selected, cache.clone(), "secret").await;
        // Allow the spawned score adjustment to land.
        tokio::task::yield_now().await;

        let member = score_member("secret", "p1", "sk-secret-raw");
        assert_ne!(member, "sk-secret-raw");
        assert!(!member.contains("sk-secret-raw"));
        assert!(
            cache
                .zscore(&keys::key_scores("p1"), &member)
                .await
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn score_member_is_stable_hex() {
        let a = score_member("s", "p", "k");
        let b = score_member("s", "p", "k");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn label_masking_uses_tail() {
        assert_eq!(mask_label("sk-abcdef", None, 0), "key1-***cdef");
        assert_eq!(mask_label("", None, 2), "key3-***xxxx");
        assert_eq!(mask_label("sk-x", Some("primary"), 0), "primary");
    }
}
