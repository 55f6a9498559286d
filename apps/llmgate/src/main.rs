use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use llmgate_cache::{MemoryCache, SharedCache};
use llmgate_common::GatewayConfigPatch;
use llmgate_core::engine::GatewayEngine;
use llmgate_core::state::AppState;
use llmgate_core::upstream_client::{UpstreamClient, UpstreamClientConfig, WreqUpstreamClient};
use llmgate_provider_core::{MetricsBuffer, TracingMetricsSink};

mod cli;
mod config_file;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log_filter))
        .init();

    let file = config_file::load(&args.config)?;

    // Merge order: file < env/CLI.
    let mut patch = file.gateway.into_patch();
    patch.overlay(GatewayConfigPatch {
        host: args.host,
        port: args.port,
        secret_key: args.secret,
        ..Default::default()
    });
    let gateway = patch.into_config()?;
    let bind = format!("{}:{}", gateway.host, gateway.port);

    let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
    let metrics = Arc::new(MetricsBuffer::new(
        gateway.metrics,
        Arc::new(TracingMetricsSink),
    ));
    let flusher = metrics.spawn_flusher();

    let state = Arc::new(AppState::new(
        gateway,
        file.providers,
        file.logical_models,
        file.strategy.unwrap_or_default(),
        file.gateway_keys,
        cache,
        metrics.clone(),
        Arc::new(llmgate_provider_impl::default_sdk_registry()),
    ));

    let upstream: Arc<dyn UpstreamClient> =
        Arc::new(WreqUpstreamClient::new(UpstreamClientConfig::default())?);
    let engine = Arc::new(GatewayEngine::new(state, upstream));
    let app = llmgate_router::gateway_router(engine);

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(bind = %bind, "llmgate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    // Drain buffered metrics before exit.
    flusher.abort();
    metrics.flush().await;
    Ok(())
}
