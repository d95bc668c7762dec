mod auth;
mod command;
mod config;
mod daemon;
mod pktline;
mod repo;
mod service;
mod ssh;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::daemon::{BindAddress, SshDaemon};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "gitgate", about = "Git-over-SSH access gateway daemon")]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, default_value = "/etc/gitgate/config.yaml")]
    config: String,
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    // ---- Config ----
    let config = config::load_config(&cli.config)?;

    tracing::info!(config_path = %cli.config, "starting gitgate");

    // ---- Ensure the repository root exists ----
    tokio::fs::create_dir_all(&config.storage.repo_root)
        .await
        .with_context(|| {
            format!(
                "failed to create repo root: {}",
                config.storage.repo_root.display()
            )
        })?;

    // ---- Daemon ----
    let address = BindAddress::new(config.daemon.bind_interface.clone(), config.daemon.port);
    let daemon = SshDaemon::new(
        address,
        &config.storage.config_root,
        &config.storage.repo_root,
        &config,
    )?;

    daemon.start().await?;

    // ---- Await shutdown ----
    shutdown_signal().await;
    daemon.stop().await;

    tracing::info!("gitgate shut down cleanly");
    Ok(())
}
