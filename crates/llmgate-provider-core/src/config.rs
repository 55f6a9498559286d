use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use llmgate_transform::ApiStyle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    Sdk,
    ClaudeCli,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Http => "http",
            TransportKind::Sdk => "sdk",
            TransportKind::ClaudeCli => "claude_cli",
        }
    }
}

fn default_weight() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_qps: Option<u32>,
}

/// Static configuration for one upstream provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub id: String,
    pub base_url: String,
    #[serde(default = "default_transport")]
    pub transport: TransportKind,
    /// Required when transport is `sdk`; must name a registered driver.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdk_vendor: Option<String>,
    pub api_keys: Vec<ApiKeyEntry>,
    /// Authoritative when non-empty; otherwise support is inferred from the
    /// configured paths.
    #[serde(default)]
    pub supported_api_styles: Vec<ApiStyle>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chat_completions_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub messages_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub responses_path: Option<String>,
    /// Overrides the default `{429, 5xx}` retryable set when non-empty.
    #[serde(default)]
    pub retryable_status_codes: Vec<u16>,
    #[serde(default)]
    pub custom_headers: BTreeMap<String, String>,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_qps: Option<u32>,
    /// Models advertised without asking the upstream `/models` endpoint.
    #[serde(default)]
    pub static_models: Vec<String>,
    /// Per-provider alias table: requested id -> advertised id.
    #[serde(default)]
    pub model_aliases: BTreeMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_transport() -> TransportKind {
    TransportKind::Http
}

impl ProviderConfig {
    pub fn supports_style(&self, style: ApiStyle) -> bool {
        if !self.supported_api_styles.is_empty() {
            return self.supported_api_styles.contains(&style);
        }
        match style {
            ApiStyle::Responses => self.responses_path.is_some(),
            ApiStyle::Claude => self.messages_path.is_some(),
            ApiStyle::OpenAI => true,
        }
    }

    pub fn path_for_style(&self, style: ApiStyle) -> Option<String> {
        let path = match style {
            ApiStyle::Responses => self.responses_path.clone()?,
            ApiStyle::Claude => self.messages_path.clone()?,
            ApiStyle::OpenAI => self
                .chat_completions_path
                .clone()
                .unwrap_or_else(|| "/v1/chat/completions".to_string()),
        };
        let trimmed = path.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(if trimmed.starts_with('/') {
            trimmed.to_string()
        } else {
            format!("/{trimmed}")
        })
    }

    pub fn is_retryable_status(&self, status: u16) -> bool {
        if !self.retryable_status_codes.is_empty() {
            return self.retryable_status_codes.contains(&status);
        }
        status == 429 || (500..600).contains(&status)
    }

    /// Resolve an alias to the advertised model id, if configured.
    pub fn resolve_alias(&self, lookup_id: &str) -> Option<&str> {
        self.model_aliases.get(lookup_id).map(String::as_str)
    }
}

/// One concrete call target: provider + upstream model + endpoint + dialect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Upstream {
    pub provider_id: String,
    pub upstream_model_id: String,
    pub endpoint: String,
    pub api_style: ApiStyle,
    pub base_weight: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_qps: Option<u32>,
}

/// A group of upstreams advertised under one client-facing id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalModel {
    pub logical_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub upstreams: Vec<Upstream>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

/// Latest-window health metrics for one (logical model, provider) pair,
/// read back from the shared cache.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RoutingMetrics {
    pub latency_p95_ms: f64,
    pub latency_p99_ms: f64,
    /// 0.0..=1.0
    pub error_rate: f64,
    pub success_qps_1m: f64,
    pub total_requests_1m: u64,
    pub status: HealthStatus,
    #[serde(with = "time::serde::rfc3339")]
    pub last_updated: OffsetDateTime,
}

/// Coefficients for the scheduler scoring formula.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulingStrategy {
    pub name: String,
    /// Latency weight coefficient.
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    /// Error-rate weight coefficient.
    #[serde(default = "default_alpha")]
    pub beta: f64,
    /// Cost weight coefficient.
    #[serde(default = "default_gamma")]
    pub gamma: f64,
    /// Quota penalty coefficient.
    #[serde(default = "default_gamma")]
    pub delta: f64,
    #[serde(default = "default_min_score")]
    pub min_score: f64,
    #[serde(default = "default_true")]
    pub enable_stickiness: bool,
    #[serde(default = "default_stickiness_ttl")]
    pub stickiness_ttl_secs: u64,
    /// A sticky binding survives while its score is within this fraction of
    /// the top score.
    #[serde(default = "default_drift_tolerance")]
    pub drift_tolerance: f64,
}

fn default_alpha() -> f64 {
    0.3
}

fn default_gamma() -> f64 {
    0.2
}

fn default_min_score() -> f64 {
    0.1
}

fn default_stickiness_ttl() -> u64 {
    7200
}

fn default_drift_tolerance() -> f64 {
    0.2
}

impl Default for SchedulingStrategy {
    fn default() -> Self {
        Self {
            name: "balanced".to_string(),
            alpha: default_alpha(),
            beta: default_alpha(),
            gamma: default_gamma(),
            delta: default_gamma(),
            min_score: default_min_score(),
            enable_stickiness: true,
            stickiness_ttl_secs: default_stickiness_ttl(),
            drift_tolerance: default_drift_tolerance(),
        }
    }
}
