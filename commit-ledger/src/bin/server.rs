//! Ledger node binary

use anyhow::Context;
use commit_ledger::{Config, Ledger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    tracing::info!("Starting commit-chain ledger node");

    // File given as first argument, environment otherwise
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path).with_context(|| format!("loading config from {}", path))?,
        None => Config::from_env().context("loading config from environment")?,
    };

    let ledger = Ledger::open(config).await.context("opening ledger")?;
    tracing::info!(operator = %ledger.operator(), "Ledger opened successfully");

    tokio::signal::ctrl_c().await?;

    tracing::info!("Shutting down ledger node");
    tracing::debug!(metrics = %ledger.metrics().render()?, "Final metrics");
    ledger.shutdown().await?;
    Ok(())
}
