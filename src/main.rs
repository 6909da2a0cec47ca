//! admitd: a line-protocol TCP server with bounded admission
//!
//! Connections beyond the concurrency limit wait in a FIFO queue for a free
//! slot and are dropped if none frees up in time.
//!
//! Features:
//! - Fixed-size worker pool (`max_clients`)
//! - Unbounded waiting queue with per-connection wait deadline
//! - Event-driven dispatcher, no busy polling
//! - Configuration via CLI arguments or TOML file

mod admission;
mod config;
mod connection;
mod error;
mod pool;
mod queue;
mod server;
mod session;

use config::Config;
use server::Server;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        max_clients = config.admission.max_clients,
        wait_timeout_ms = config.admission.wait_timeout.as_millis() as u64,
        processing_delay_ms = config.processing_delay.as_millis() as u64,
        "Starting admitd server"
    );

    let server = Server::bind(&config)?;
    let stats = server.run_until(shutdown_signal()).await;

    info!(
        admitted = stats.admitted,
        queued = stats.queued,
        admitted_from_queue = stats.admitted_from_queue,
        evicted = stats.evicted,
        waiting = stats.waiting,
        still_running = stats.occupied,
        peak_occupied = stats.peak_occupied,
        "Server stopped"
    );
    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}
