//! tailrelay agent
//!
//! Runs the status sweep against the configured Caddy instance and forwarder
//! processes so persisted relay statuses track reality between CLI calls.

use std::sync::Arc;

use anyhow::{Context, Result};
use tailrelay_agent::{Config, Reconciler, Sweeper};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting tailrelay agent");
    info!(
        admin_url = %config.admin_url,
        db_path = %config.db_path.display(),
        forwarder_bin = %config.forwarder_bin.display(),
        forwarder_log = ?config.forwarder_log,
        sweep_interval_secs = config.sweep_interval.as_secs(),
        "Configuration loaded"
    );

    let reconciler =
        Arc::new(Reconciler::from_config(&config).context("failed to initialize reconciler")?);

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let sweeper = Sweeper::new(Arc::clone(&reconciler), config.sweep_interval);
    let sweeper_handle = tokio::spawn(async move { sweeper.run(shutdown_rx).await });

    // Wait for shutdown signal
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper_handle.await {
        error!(error = %e, "Sweeper task panicked");
    }

    info!("Relay agent shutdown complete");
    Ok(())
}
