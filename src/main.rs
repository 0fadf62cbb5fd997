//! car-lookup-server: a line-protocol lookup server
//!
//! Clients connect over TCP and send one number per line. For each request
//! the server:
//! - sleeps for the requested number of seconds, simulating work
//! - looks up the scaled value (milliseconds) in a fixed car registry
//! - replies with the result and a readiness line
//!
//! Features:
//! - Bounded worker pool, one slot per connection
//! - Per-connection read timeout
//! - Graceful shutdown on Ctrl-C / SIGTERM
//! - Configuration via CLI arguments or TOML file

mod config;
mod pool;
mod protocol;
mod registry;
mod server;
mod session;

use config::Config;
use registry::{Lookup, Registry};
use server::Server;
use std::sync::Arc;
use tracing::{info, warn};
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
        host = %config.host,
        port = config.port,
        pool_size = config.pool_size.get(),
        read_timeout_secs = config.read_timeout.as_secs(),
        shutdown_grace_secs = config.shutdown_grace.as_secs(),
        "Starting car-lookup-server"
    );

    let registry: Arc<dyn Lookup> = Arc::new(Registry::new(
        config.entries.clone(),
        config.not_found.clone(),
    ));

    let server = Server::new(config, registry);
    server.run(shutdown_signal()).await?;
    Ok(())
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
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
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
}
