use clap::Parser;

#[derive(Parser)]
#[command(name = "llmgate")]
pub(crate) struct Cli {
    /// Path to the JSON config file (providers, models, keys, strategy).
    #[arg(long, default_value = "llmgate.json")]
    pub(crate) config: String,
    #[arg(long)]
    pub(crate) host: Option<String>,
    #[arg(long)]
    pub(crate) port: Option<u16>,
    /// Gateway secret for HMAC derivations; prefer the env var.
    #[arg(long, env = "LLMGATE_SECRET")]
    pub(crate) secret: Option<String>,
    /// tracing-subscriber env filter, e.g. `llmgate=debug,info`.
    #[arg(long, env = "LLMGATE_LOG", default_value = "info")]
    pub(crate) log_filter: String,
}
