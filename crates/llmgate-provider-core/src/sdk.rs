use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use llmgate_transform::{ApiStyle, ChatRequest, ChatResponse, StreamEvent};

use crate::errors::ProviderError;

/// Everything a driver needs for one vendor call.
#[derive(Debug, Clone)]
pub struct SdkCallContext {
    pub provider_id: String,
    pub base_url: String,
    pub api_key: String,
    pub upstream_model: String,
}

/// Driver-produced stream items. `Err` carries the upstream failure for the
/// retry loop to classify.
pub type SdkEventStream = tokio::sync::mpsc::Receiver<Result<StreamEvent, ProviderError>>;

/// One vendor SDK integration.
///
/// Drivers accept and return payloads in their declared native dialect;
/// the engine adapts to and from the client's dialect around the call.
#[async_trait]
pub trait SdkDriver: Send + Sync {
    fn vendor(&self) -> &'static str;

    /// The dialect `generate`/`stream` speak.
    fn native_style(&self) -> ApiStyle;

    async fn generate(
        &self,
        ctx: &SdkCallContext,
        request: &ChatRequest,
    ) -> Result<ChatResponse, ProviderError>;

    async fn stream(
        &self,
        ctx: &SdkCallContext,
        request: &ChatRequest,
    ) -> Result<SdkEventStream, ProviderError>;

    async fn list_models(&self, ctx: &SdkCallContext) -> Result<Vec<String>, ProviderError>;
}

/// Vendor slug -> driver. New vendors are added by registering a row.
#[derive(Default)]
pub struct SdkRegistry {
    drivers: HashMap<String, Arc<dyn SdkDriver>>,
}

impl SdkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Arc<dyn SdkDriver>) {
        self.drivers.insert(driver.vendor().to_string(), driver);
    }

    pub fn get(&self, vendor: &str) -> Result<Arc<dyn SdkDriver>, ProviderError> {
        self.drivers
            .get(vendor)
            .cloned()
            .ok_or_else(|| ProviderError::UnknownSdkVendor(vendor.to_string()))
    }
}
