//! Provider-side building blocks for the gateway.
//!
//! This crate intentionally does **not** depend on axum or any concrete
//! HTTP client. It owns provider/model configuration, the per-provider API
//! key pool, the upstream error classifier, the SDK driver registry, and
//! the in-process metrics buffer; a higher layer performs IO.

pub mod classify;
pub mod config;
pub mod errors;
pub mod keypool;
pub mod metrics;
pub mod sdk;

pub use classify::{Capability, Classification, ErrorCategory, classify_upstream_error,
    extract_error_message, is_messages_path_miss};
pub use config::{
    ApiKeyEntry, HealthStatus, LogicalModel, ProviderConfig, RoutingMetrics, SchedulingStrategy,
    TransportKind, Upstream,
};
pub use errors::ProviderError;
pub use keypool::{KeyPool, SelectedKey, score_member};
pub use metrics::{MetricsBuffer, MetricsRecord, MetricsSink, SampleKey, TracingMetricsSink};
pub use sdk::{SdkCallContext, SdkDriver, SdkEventStream, SdkRegistry};
