//! molassh: a slow fake SSH server
//!
//! Listens on a TCP port and, instead of speaking SSH, trickles randomized
//! protocol-looking garbage at connecting clients to keep them occupied.
//!
//! Features:
//! - Per-connection stall loop with a configurable write cadence
//! - Shared garbage-line generator with rendezvous hand-off
//! - Distinct remote address telemetry, reported once per minute
//! - JSON connection-event stream on stdout, operational log on stderr
//! - Configuration via CLI arguments, environment, or TOML file

mod config;
mod connection;
mod events;
mod generator;
mod registry;
mod server;

use config::Config;
use events::JsonStdoutSink;
use server::Server;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging; stdout is reserved for the event stream.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    info!(
        addr = %config.addr,
        port = config.port,
        delay_secs = config.delay.as_secs(),
        max_line_length = config.max_line_length,
        "Starting molassh tarpit"
    );

    let shutdown = CancellationToken::new();
    spawn_signal_listener(shutdown.clone());

    let server = Server::bind(config, Arc::new(JsonStdoutSink), shutdown.clone()).await?;
    info!(address = %server.local_addr()?, "Server listening");

    // The accept loop only ever returns an error; after a shutdown signal
    // the non-zero exit is expected and operators should treat it as such.
    match server.run().await {
        Err(e) if e.is_shutdown() => {
            info!("Listener closed after shutdown signal.");
            Err(e.into())
        }
        Err(e) => {
            error!(error = %e, "Accept loop failed");
            Err(e.into())
        }
        Ok(()) => Ok(()),
    }
}

/// Cancel the shared token on the first SIGINT or SIGTERM.
fn spawn_signal_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to create SIGTERM stream");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("SIGINT received, initiating shutdown."),
            _ = sigterm.recv() => info!("SIGTERM received, initiating shutdown."),
        }
        shutdown.cancel();
    });
}
