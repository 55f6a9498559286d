//! Header and URL profile that imitates the official Claude CLI.
//!
//! Some Anthropic-compatible relays only accept traffic that looks like the
//! CLI; the `claude_cli` transport reshapes the call accordingly and the
//! engine adapts payloads to and from Claude Messages around it.

const CLI_USER_AGENT: &str = "claude-cli/1.0.24 (external, cli)";
const CLI_BETA_HEADER: &str = "claude-code-20250219";
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, Default)]
pub struct ClaudeCliProfile;

impl ClaudeCliProfile {
    pub fn new() -> Self {
        Self
    }

    /// `{base}/v1/messages?beta=true`
    pub fn messages_url(&self, base_url: &str) -> String {
        format!("{}/v1/messages?beta=true", base_url.trim_end_matches('/'))
    }

    pub fn headers(&self, api_key: &str, is_stream: bool) -> Vec<(String, String)> {
        let accept = if is_stream {
            "text/event-stream"
        } else {
            "application/json"
        };
        vec![
            ("x-api-key".to_string(), api_key.to_string()),
            ("anthropic-version".to_string(), ANTHROPIC_VERSION.to_string()),
            ("anthropic-beta".to_string(), CLI_BETA_HEADER.to_string()),
            ("user-agent".to_string(), CLI_USER_AGENT.to_string()),
            ("accept".to_string(), accept.to_string()),
            ("content-type".to_string(), "application/json".to_string()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_url_appends_beta_flag() {
        let profile = ClaudeCliProfile::new();
        assert_eq!(
            profile.messages_url("https://relay.example.com/"),
            "https://relay.example.com/v1/messages?beta=true"
        );
    }

    #[test]
    fn headers_carry_cli_identity() {
        let profile = ClaudeCliProfile::new();
        let headers = profile.headers("sk-test", true);
        let get = |name: &str| {
            headers
                .iter()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.as_str())
        };
        assert_eq!(get("x-api-key"), Some("sk-test"));
        assert_eq!(get("anthropic-version"), Some(ANTHROPIC_VERSION));
        assert_eq!(get("user-agent"), Some(CLI_USER_AGENT));
        assert_eq!(get("accept"), Some("text/event-stream"));
    }
}
