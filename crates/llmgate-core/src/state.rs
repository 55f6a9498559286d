use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use llmgate_cache::SharedCache;
use llmgate_common::GatewayConfig;
use llmgate_provider_core::{
    KeyPool, LogicalModel, MetricsBuffer, ProviderConfig, SchedulingStrategy, SdkRegistry,
};
use llmgate_provider_impl::ClaudeCliProfile;

use crate::auth::GatewayKey;

/// Per-provider runtime: hot-swappable config plus the key pool that owns
/// this provider's in-process key state.
pub struct ProviderRuntime {
    pub config: ArcSwap<ProviderConfig>,
    pub pool: KeyPool,
}

impl ProviderRuntime {
    pub fn new(config: ProviderConfig) -> Self {
        let pool = KeyPool::new(config.id.clone());
        Self {
            config: ArcSwap::from_pointee(config),
            pool,
        }
    }
}

/// Process-wide gateway state. Snapshots swap atomically on config reload;
/// request tasks read through `load()` without locking.
pub struct AppState {
    pub gateway: ArcSwap<GatewayConfig>,
    pub providers: ArcSwap<HashMap<String, Arc<ProviderRuntime>>>,
    pub logical_models: ArcSwap<HashMap<String, LogicalModel>>,
    pub strategy: ArcSwap<SchedulingStrategy>,
    pub gateway_keys: ArcSwap<Vec<GatewayKey>>,
    pub cache: Arc<dyn SharedCache>,
    pub metrics: Arc<MetricsBuffer>,
    pub sdk: Arc<SdkRegistry>,
    pub cli_profile: ClaudeCliProfile,
}

impl AppState {
    pub fn new(
        gateway: GatewayConfig,
        providers: Vec<ProviderConfig>,
        logical_models: Vec<LogicalModel>,
        strategy: SchedulingStrategy,
        gateway_keys: Vec<GatewayKey>,
        cache: Arc<dyn SharedCache>,
        metrics: Arc<MetricsBuffer>,
        sdk: Arc<SdkRegistry>,
    ) -> Self {
        let providers: HashMap<String, Arc<ProviderRuntime>> = providers
            .into_iter()
            .map(|config| (config.id.clone(), Arc::new(ProviderRuntime::new(config))))
            .collect();
        let logical_models: HashMap<String, LogicalModel> = logical_models
            .into_iter()
            .map(|model| (model.logical_id.clone(), model))
            .collect();
        Self {
            gateway: ArcSwap::from_pointee(gateway),
            providers: ArcSwap::from_pointee(providers),
            logical_models: ArcSwap::from_pointee(logical_models),
            strategy: ArcSwap::from_pointee(strategy),
            gateway_keys: ArcSwap::from_pointee(gateway_keys),
            cache,
            metrics,
            sdk,
            cli_profile: ClaudeCliProfile::new(),
        }
    }

    pub fn provider(&self, provider_id: &str) -> Option<Arc<ProviderRuntime>> {
        self.providers.load().get(provider_id).cloned()
    }

    /// Apply a reloaded provider set: existing runtimes keep their pool
    /// state, new providers get fresh pools, removed ones are dropped.
    pub fn apply_provider_configs(&self, configs: Vec<ProviderConfig>) {
        let current = self.providers.load();
        let mut next: HashMap<String, Arc<ProviderRuntime>> = HashMap::new();
        for config in configs {
            match current.get(&config.id) {
                Some(runtime) => {
                    runtime.config.store(Arc::new(config.clone()));
                    next.insert(config.id.clone(), runtime.clone());
                }
                None => {
                    next.insert(config.id.clone(), Arc::new(ProviderRuntime::new(config)));
                }
            }
        }
        self.providers.store(Arc::new(next));
    }

    pub fn apply_logical_models(&self, models: Vec<LogicalModel>) {
        let map: HashMap<String, LogicalModel> = models
            .into_iter()
            .map(|model| (model.logical_id.clone(), model))
            .collect();
        self.logical_models.store(Arc::new(map));
    }
}
