//! Node connector daemon
//!
//! Runs one connector over its configured backend and serves it through the
//! API-key protected HTTP facade.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nc_connector::reconcile::run_reconciliation;
use nc_connector::server::ConnectorServer;
use nc_connector::Connector;
use nc_core::config::{self, ConnectorConfig, API_KEY_ENV};

#[derive(Parser)]
#[command(name = "nc-connector")]
#[command(about = "Node connector daemon")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Run in foreground with verbose output
    #[arg(short, long)]
    foreground: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.foreground { "debug" } else { &args.log_level };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| log_level.into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Node connector starting...");

    // Load configuration
    let mut config: ConnectorConfig = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                ConnectorConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            ConnectorConfig::default()
        }
    };

    if let Some(bind) = args.bind {
        config.bind_address = bind;
    }
    config.validate().context("Invalid configuration")?;

    let Some(api_key) = config.resolve_api_key() else {
        bail!(
            "No API key configured; set `api_key` in the config file or {}",
            API_KEY_ENV
        );
    };

    let connector = Arc::new(Connector::from_config(config).context("Failed to open tracker")?);

    // The backend may come up later; reconciliation keeps retrying the inventory
    if let Err(e) = connector.initialize().await {
        tracing::warn!("Backend initialization failed: {}", e);
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(mut signal) => {
                    signal.recv().await;
                }
                Err(e) => {
                    tracing::warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    let reconciler = tokio::spawn(run_reconciliation(Arc::clone(&connector), cancel.clone()));

    let server = ConnectorServer::new(Arc::clone(&connector), api_key).with_shutdown_token(cancel.clone());
    let served = server.run().await;

    // Stop reconciliation whichever way the server ended
    cancel.cancel();
    if let Err(e) = reconciler.await {
        tracing::warn!("Reconciliation task ended abnormally: {}", e);
    }

    if let Err(e) = connector.shutdown().await {
        tracing::warn!("Backend shutdown failed: {}", e);
    }

    served.context("Facade server failed")?;
    tracing::info!("Connector shutdown complete");
    Ok(())
}
