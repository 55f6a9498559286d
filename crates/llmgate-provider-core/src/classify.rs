use serde_json::Value as JsonValue;

use crate::config::ProviderConfig;

const UNSUPPORTED_MARKERS: &[&str] = &[
    "does not support",
    "do not support",
    "not support",
    "unsupported",
    "not enabled",
    "not available",
];

const TOOLS_HINTS: &[&str] = &[
    "tool",
    "tools",
    "tool_calls",
    "function",
    "functions",
    "function calling",
];

const VISION_HINTS: &[&str] = &["vision", "image", "images", "image_url", "multimodal"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Tools,
    Vision,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Tools => "tools",
            Capability::Vision => "vision",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No HTTP response at all.
    Transport,
    /// Retryable upstream status (rate limit, 5xx, provider-declared).
    Retryable,
    /// The upstream rejected a capability the request needs; another
    /// provider may serve it. Not a provider fault.
    CapabilityMismatch(Capability),
    /// Any other 4xx; surfaced to the client, loop aborts.
    Terminal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub retryable: bool,
    pub penalize: bool,
    pub category: ErrorCategory,
}

/// Classify one upstream failure. `status` is `None` for transport errors.
pub fn classify_upstream_error(
    config: &ProviderConfig,
    status: Option<u16>,
    body: &[u8],
) -> Classification {
    let Some(status) = status else {
        return Classification {
            retryable: true,
            penalize: true,
            category: ErrorCategory::Transport,
        };
    };

    if config.is_retryable_status(status) {
        return Classification {
            retryable: true,
            penalize: true,
            category: ErrorCategory::Retryable,
        };
    }

    if let Some(capability) = classify_capability_mismatch(status, body) {
        return Classification {
            retryable: true,
            penalize: false,
            category: ErrorCategory::CapabilityMismatch(capability),
        };
    }

    Classification {
        retryable: false,
        penalize: true,
        category: ErrorCategory::Terminal,
    }
}

/// Conservative capability detection: only 400/422 bodies whose message
/// carries both an unsupported marker and a capability hint qualify.
pub fn classify_capability_mismatch(status: u16, body: &[u8]) -> Option<Capability> {
    if status != 400 && status != 422 {
        return None;
    }
    let message = extract_error_message(body).to_lowercase();
    if message.is_empty() {
        return None;
    }
    if !UNSUPPORTED_MARKERS
        .iter()
        .any(|marker| message.contains(marker))
    {
        return None;
    }
    if TOOLS_HINTS.iter().any(|hint| message.contains(hint)) {
        return Some(Capability::Tools);
    }
    if VISION_HINTS.iter().any(|hint| message.contains(hint)) {
        return Some(Capability::Vision);
    }
    None
}

/// A 404/405 from a Claude messages path whose body reads like a routing
/// miss; triggers the chat.completions fallback for the same candidate.
pub fn is_messages_path_miss(status: u16, body: &[u8]) -> bool {
    if status != 404 && status != 405 {
        return false;
    }
    let message = extract_error_message(body).to_lowercase();
    message.is_empty()
        || message.contains("not found")
        || message.contains("invalid url")
        || message.contains("no route")
        || message.contains("method not allowed")
}

/// Pull a human-readable message out of an upstream error body.
///
/// Understands the OpenAI envelope, the Anthropic envelope, bare
/// `{"message": ...}` and `{"detail": ...}` shapes; falls back to the raw
/// text.
pub fn extract_error_message(body: &[u8]) -> String {
    let text = String::from_utf8_lossy(body);
    let Ok(parsed) = serde_json::from_str::<JsonValue>(&text) else {
        return text.trim().to_string();
    };
    extract_from_json(&parsed).unwrap_or_else(|| text.trim().to_string())
}

fn extract_from_json(value: &JsonValue) -> Option<String> {
    let object = value.as_object()?;
    if let Some(error) = object.get("error").and_then(|v| v.as_object())
        && let Some(message) = error.get("message").and_then(|v| v.as_str())
    {
        let message = message.trim();
        if !message.is_empty() {
            return Some(message.to_string());
        }
    }
    for field in ["message", "detail"] {
        if let Some(message) = object.get(field).and_then(|v| v.as_str()) {
            let message = message.trim();
            if !message.is_empty() {
                return Some(message.to_string());
            }
        }
    }
    None
}
