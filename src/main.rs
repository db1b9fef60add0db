//! Toolbridge CLI entry point.

use anyhow::Context as _;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use std::net::SocketAddr;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "toolbridge")]
#[command(about = "Bridge a local language model to stdio worker processes")]
struct Cli {
    /// Path to config file (optional)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,

    /// Address for the HTTP server, overrides the config file
    #[arg(short, long)]
    bind: Option<SocketAddr>,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // RUST_LOG wins over --debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cli.debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    tracing_subscriber::fmt().with_env_filter(filter).init();

    tracing::info!("starting toolbridge");

    let config = toolbridge::config::Config::load(cli.config.as_deref())
        .with_context(|| "failed to load configuration")?;
    let bind = cli.bind.unwrap_or(config.server.bind);

    tracing::info!(
        model = %config.llm.model,
        workers = config.workers.len(),
        "configuration loaded"
    );

    let registry = Arc::new(toolbridge::worker::WorkerRegistry::start(
        &config.workers,
        config.bridge.call_timeout(),
    ));
    tracing::info!(workers = ?registry.worker_names(), "workers started");

    let model = toolbridge::llm::OllamaClient::new(&config.llm)
        .with_context(|| "failed to initialize model client")?;

    let bridge = toolbridge::bridge::Bridge::new(registry.clone(), Arc::new(model));
    let state = Arc::new(toolbridge::api::ApiState::new(bridge));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let server = match toolbridge::api::start_http_server(bind, state, shutdown_rx).await {
        Ok(server) => server,
        Err(error) => {
            registry.shutdown().await;
            return Err(error.context(format!("failed to bind HTTP server on {bind}")));
        }
    };

    tokio::signal::ctrl_c()
        .await
        .with_context(|| "failed to listen for shutdown signal")?;

    tracing::info!("shutdown signal received");
    let _ = shutdown_tx.send(true);
    if let Err(error) = server.await {
        tracing::warn!(%error, "HTTP server task failed");
    }
    registry.shutdown().await;

    tracing::info!("toolbridge stopped");
    Ok(())
}
