//! Vendor-specific provider pieces: SDK drivers and wire profiles that the
//! transport executor dispatches to.

pub mod claude_cli;
pub mod gemini;

pub use claude_cli::ClaudeCliProfile;
pub use gemini::GeminiDriver;

use std::sync::Arc;

use llmgate_provider_core::SdkRegistry;

/// Registry with every in-tree driver registered.
pub fn default_sdk_registry() -> SdkRegistry {
    let mut registry = SdkRegistry::new();
    registry.register(Arc::new(GeminiDriver::new()));
    registry
}
