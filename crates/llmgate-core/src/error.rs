use serde::Serialize;

/// Client-facing gateway error. Serialized as
/// `{"error_code", "message", "error_id"}` on every non-2xx response.
#[derive(Debug, Clone, Serialize)]
pub struct GatewayError {
    #[serde(skip)]
    pub status: u16,
    pub error_code: String,
    pub message: String,
    pub error_id: String,
}

impl GatewayError {
    pub fn new(status: u16, error_code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            error_code: error_code.into(),
            message: message.into(),
            error_id: llmgate_common::new_error_id(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, "invalid_request", message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, "unauthorized", message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(403, "forbidden", message)
    }

    pub fn model_not_available(model: &str) -> Self {
        Self::new(
            400,
            "model_not_available",
            format!("model '{model}' is not available"),
        )
    }

    pub fn no_provider_available(message: impl Into<String>) -> Self {
        Self::new(503, "no_provider_available", message)
    }

    pub fn upstream_failed(message: impl Into<String>) -> Self {
        Self::new(502, "upstream_error", message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(500, "internal_error", message)
    }
}

impl std::fmt::Display for GatewayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}: {}", self.status, self.error_code, self.message)
    }
}

impl std::error::Error for GatewayError {}
