//! Courier Gateway - public entry point for transfer and inbox token paths
//!
//! Resolves `/TOKEN` style paths into redirects and file deliveries, and
//! periodically purges expired allocations.

mod config;
mod logging;
mod reaper;
mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;

use common::Courier;

use crate::config::GatewayConfig;
use crate::server::GatewayState;

const FINAL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Courier Gateway - serves anonymous transfers and inbox redirects
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on for HTTP requests (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Log level (error, warn, info, debug, trace; overrides config)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = GatewayConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.listen_port = port;
    }
    if let Some(log_level) = args.log_level {
        config.log_level = log_level;
    }

    let _logging = logging::init(&config)?;
    tracing::info!("Starting Courier Gateway");

    let courier = Courier::memory();

    // Set up graceful shutdown
    let (shutdown_tx, shutdown_rx) = watch::channel(());
    let graceful_shutdown = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for ctrl+c: {}", e);
        }
        tracing::info!("Received shutdown signal");
        let _ = shutdown_tx.send(());
    };
    tokio::spawn(graceful_shutdown);

    // Spawn reaper
    let reaper_handle = tokio::spawn(reaper::run(
        courier.clone(),
        config.reaper_interval(),
        config.reaper_batch_size,
        shutdown_rx.clone(),
    ));

    let listen_addr = SocketAddr::from_str(&format!("0.0.0.0:{}", config.listen_port))?;
    let router = server::router(GatewayState {
        courier,
        config: Arc::new(config),
    });

    tracing::info!("Gateway listening on {}", listen_addr);
    let listener = tokio::net::TcpListener::bind(listen_addr).await?;

    let mut server_rx = shutdown_rx.clone();
    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = server_rx.changed().await;
        })
        .await?;

    let _ = tokio::time::timeout(FINAL_SHUTDOWN_TIMEOUT, reaper_handle).await;

    tracing::info!("Gateway shutdown complete");
    Ok(())
}
