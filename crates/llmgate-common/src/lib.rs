use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GatewayConfigError {
    #[error("missing required gateway config field: {0}")]
    MissingField(&'static str),
}

/// Final, merged gateway configuration used by the running process.
///
/// Merge order: CLI > ENV > config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    /// Secret used for HMAC-SHA256 derivations (client key lookup,
    /// preference-score members). Never logged.
    pub secret_key: String,
    /// TTL for session sticky bindings and the conversation debug ring.
    pub session_ttl_secs: u64,
    /// TTL for cached per-provider `/models` lists.
    pub model_list_ttl_secs: u64,
    /// Consecutive recent failures after which a provider is skipped.
    pub failure_cooldown_threshold: u32,
    /// Sliding window (and skip duration) for the failure counter.
    pub failure_cooldown_secs: u64,
    pub metrics: MetricsSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricsSettings {
    /// Wall-clock bucket width for aggregation, UTC-aligned.
    pub bucket_secs: u64,
    pub flush_interval_secs: u64,
    /// Distinct-bucket bound; the oldest bucket is force-flushed when full.
    pub max_buckets: usize,
    /// Latency reservoir size per bucket.
    pub reservoir_size: usize,
    /// Probability of keeping a success latency sample (errors always kept).
    pub success_sample_rate: f64,
    /// When false, every sample is upserted synchronously.
    pub buffered: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            bucket_secs: 60,
            flush_interval_secs: 10,
            max_buckets: 4096,
            reservoir_size: 128,
            success_sample_rate: 1.0,
            buffered: true,
        }
    }
}

/// Optional layer used for merging gateway config.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GatewayConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub secret_key: Option<String>,
    pub session_ttl_secs: Option<u64>,
    pub model_list_ttl_secs: Option<u64>,
    pub failure_cooldown_threshold: Option<u32>,
    pub failure_cooldown_secs: Option<u64>,
    pub metrics: Option<MetricsSettings>,
}

impl GatewayConfigPatch {
    pub fn overlay(&mut self, other: GatewayConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.secret_key.is_some() {
            self.secret_key = other.secret_key;
        }
        if other.session_ttl_secs.is_some() {
            self.session_ttl_secs = other.session_ttl_secs;
        }
        if other.model_list_ttl_secs.is_some() {
            self.model_list_ttl_secs = other.model_list_ttl_secs;
        }
        if other.failure_cooldown_threshold.is_some() {
            self.failure_cooldown_threshold = other.failure_cooldown_threshold;
        }
        if other.failure_cooldown_secs.is_some() {
            self.failure_cooldown_secs = other.failure_cooldown_secs;
        }
        if other.metrics.is_some() {
            self.metrics = other.metrics;
        }
    }

    pub fn into_config(self) -> Result<GatewayConfig, GatewayConfigError> {
        Ok(GatewayConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8989),
            secret_key: self
                .secret_key
                .ok_or(GatewayConfigError::MissingField("secret_key"))?,
            session_ttl_secs: self.session_ttl_secs.unwrap_or(7200),
            model_list_ttl_secs: self.model_list_ttl_secs.unwrap_or(300),
            failure_cooldown_threshold: self.failure_cooldown_threshold.unwrap_or(3),
            failure_cooldown_secs: self.failure_cooldown_secs.unwrap_or(30),
            metrics: self.metrics.unwrap_or_default(),
        })
    }
}

impl From<GatewayConfig> for GatewayConfigPatch {
    fn from(value: GatewayConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            secret_key: Some(value.secret_key),
            session_ttl_secs: Some(value.session_ttl_secs),
            model_list_ttl_secs: Some(value.model_list_ttl_secs),
            failure_cooldown_threshold: Some(value.failure_cooldown_threshold),
            failure_cooldown_secs: Some(value.failure_cooldown_secs),
            metrics: Some(value.metrics),
        }
    }
}

/// Correlation id attached to gateway error bodies and internal-fault logs.
pub fn new_error_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_prefers_later_layers() {
        let mut base = GatewayConfigPatch {
            host: Some("127.0.0.1".to_string()),
            port: Some(9000),
            secret_key: Some("file-secret".to_string()),
            ..Default::default()
        };
        base.overlay(GatewayConfigPatch {
            port: Some(8080),
            secret_key: Some("cli-secret".to_string()),
            ..Default::default()
        });
        let config = base.into_config().unwrap();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 8080);
        assert_eq!(config.secret_key, "cli-secret");
    }

    #[test]
    fn missing_secret_is_rejected() {
        let err = GatewayConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, GatewayConfigError::MissingField("secret_key")));
    }
}
