use serde::Deserialize;

use llmgate_common::{GatewayConfigPatch, MetricsSettings};
use llmgate_core::auth::GatewayKey;
use llmgate_provider_core::{LogicalModel, ProviderConfig, SchedulingStrategy};

/// On-disk configuration. The gateway section merges under CLI/env.
#[derive(Debug, Deserialize)]
pub(crate) struct ConfigFile {
    #[serde(default)]
    pub(crate) gateway: GatewaySection,
    #[serde(default)]
    pub(crate) providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub(crate) logical_models: Vec<LogicalModel>,
    #[serde(default)]
    pub(crate) strategy: Option<SchedulingStrategy>,
    #[serde(default)]
    pub(crate) gateway_keys: Vec<GatewayKey>,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct GatewaySection {
    pub(crate) host: Option<String>,
    pub(crate) port: Option<u16>,
    pub(crate) secret_key: Option<String>,
    pub(crate) session_ttl_secs: Option<u64>,
    pub(crate) model_list_ttl_secs: Option<u64>,
    pub(crate) failure_cooldown_threshold: Option<u32>,
    pub(crate) failure_cooldown_secs: Option<u64>,
    pub(crate) metrics: Option<MetricsSettings>,
}

impl GatewaySection {
    pub(crate) fn into_patch(self) -> GatewayConfigPatch {
        GatewayConfigPatch {
            host: self.host,
            port: self.port,
            secret_key: self.secret_key,
            session_ttl_secs: self.session_ttl_secs,
            model_list_ttl_secs: self.model_list_ttl_secs,
            failure_cooldown_threshold: self.failure_cooldown_threshold,
            failure_cooldown_secs: self.failure_cooldown_secs,
            metrics: self.metrics,
        }
    }
}

pub(crate) fn load(path: &str) -> anyhow::Result<ConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| anyhow::anyhow!("cannot read config file '{path}': {err}"))?;
    serde_json::from_str(&raw)
        .map_err(|err| anyhow::anyhow!("cannot parse config file '{path}': {err}"))
}
