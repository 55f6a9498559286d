use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::GatewayError;

/// One client-facing gateway key. Only the HMAC digest of the key is held
/// in memory; the plaintext lives with the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayKey {
    /// Hex HMAC-SHA256 of the raw key under the gateway secret.
    pub key_digest: String,
    pub label: String,
    pub user_id: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Empty means every provider is allowed.
    #[serde(default)]
    pub allowed_providers: Vec<String>,
}

fn default_enabled() -> bool {
    true
}

/// The authenticated caller attached to one request.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub user_id: String,
    pub key_label: String,
    /// `None` means unrestricted.
    pub allowed_providers: Option<Vec<String>>,
}

impl AuthContext {
    pub fn provider_allowed(&self, provider_id: &str) -> bool {
        match &self.allowed_providers {
            Some(allowed) => allowed.iter().any(|id| id == provider_id),
            None => true,
        }
    }
}

/// Hex HMAC-SHA256 of a raw client key under the gateway secret.
pub fn derive_key_digest(secret: &str, raw_key: &str) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(raw_key.as_bytes());
    let digest = mac.finalize().into_bytes();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Match a presented key against the configured set. Inactive keys produce
/// 403 with a reason; unknown keys 401.
pub fn authenticate(
    keys: &[GatewayKey],
    secret: &str,
    raw_key: &str,
) -> Result<AuthContext, GatewayError> {
    let digest = derive_key_digest(secret, raw_key);
    let Some(key) = keys.iter().find(|key| key.key_digest == digest) else {
        return Err(GatewayError::unauthorized("unknown api key"));
    };
    if !key.enabled {
        return Err(GatewayError::forbidden(format!(
            "api key '{}' is disabled",
            key.label
        )));
    }
    Ok(AuthContext {
        user_id: key.user_id.clone(),
        key_label: key.label.clone(),
        allowed_providers: if key.allowed_providers.is_empty() {
            None
        } else {
            Some(key.allowed_providers.clone())
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keys(secret: &str) -> Vec<GatewayKey> {
        vec![
            GatewayKey {
                key_digest: derive_key_digest(secret, "gk-live"),
                label: "live".to_string(),
                user_id: "u1".to_string(),
                enabled: true,
                allowed_providers: vec!["openai".to_string()],
            },
            GatewayKey {
                key_digest: derive_key_digest(secret, "gk-dead"),
                label: "dead".to_string(),
                user_id: "u2".to_string(),
                enabled: false,
                allowed_providers: Vec::new(),
            },
        ]
    }

    #[test]
    fn known_key_authenticates_with_restrictions() {
        let auth = authenticate(&keys("s"), "s", "gk-live").unwrap();
        assert_eq!(auth.user_id, "u1");
        assert!(auth.provider_allowed("openai"));
        assert!(!auth.provider_allowed("anthropic"));
    }

    #[test]
    fn unknown_key_is_401() {
        let err = authenticate(&keys("s"), "s", "gk-nope").unwrap_err();
        assert_eq!(err.status, 401);
    }

    #[test]
    fn disabled_key_is_403_with_reason() {
        let err = authenticate(&keys("s"), "s", "gk-dead").unwrap_err();
        assert_eq!(err.status, 403);
        assert!(err.message.contains("dead"));
    }
}
