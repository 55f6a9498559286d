#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("no available api key for provider {provider}: {reason}")]
    NoAvailableKey { provider: String, reason: String },
    #[error("upstream returned {status}: {message}")]
    UpstreamStatus { status: u16, message: String },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("unknown sdk vendor: {0}")]
    UnknownSdkVendor(String),
    #[error("{0}")]
    Other(String),
}
