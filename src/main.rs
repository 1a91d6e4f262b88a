//! thermolink: a TCP ingestion server for temperature/humidity sensors
//!
//! A remote embedded device pushes readings over a persistent TCP connection
//! using a newline-delimited text protocol:
//! - `DATA <temperature> <humidity>` raw readings
//! - `STATS <temp avg/max/min> <hum avg/max/min>` windowed statistics
//!
//! Decoded readings flow through a bounded queue into an append-only store;
//! operator commands (START, STOP, MODE1, MODE2, SET_FREQ, SET_WINDOW) flow
//! back to the currently connected device.

mod config;
mod console;
mod consumer;
mod ingest;
mod protocol;
mod server;
mod storage;

use config::Config;
use consumer::LatestValueLog;
use server::Server;
use std::sync::Arc;
use std::time::Duration;
use storage::Store;
use tokio::sync::watch;
use tracing::info;
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
        queue_capacity = config.queue_capacity,
        drain_interval_ms = config.drain_interval_ms,
        recent_limit = config.recent_limit,
        "Starting thermolink server"
    );

    let store = Store::new();
    let (reading_tx, reading_rx) = ingest::queue(config.queue_capacity);

    // Bind failure is fatal at startup
    let server = Arc::new(Server::start(&config.listen, reading_tx).await?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer_task = tokio::spawn(consumer::run(
        reading_rx,
        Arc::clone(&store),
        LatestValueLog,
        Duration::from_millis(config.drain_interval_ms),
        config.recent_limit,
        shutdown_rx,
    ));

    // Operator console; runs until stdin closes, dies with the process
    tokio::spawn(console::run(Arc::clone(&server), Arc::clone(&store)));

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    server.stop().await;
    let _ = shutdown_tx.send(true);
    consumer_task.await?;

    info!(records = store.len(), "Shutdown complete");
    Ok(())
}
