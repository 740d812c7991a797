//! Area Display Server
//!
//! Publishes the display server socket, negotiates a protocol with each
//! client that connects and serves its requests until it disconnects.

mod config;
mod display_server;

use anyhow::{Context, Result};
use area_ipc::{
    HandshakingConnectionCreator, PublishedSocketConnector, ServerProtocol, TracingReport,
};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{
    EnvFilter, Registry, layer::SubscriberExt, reload, util::SubscriberInitExt,
};

type FilterHandle = reload::Handle<EnvFilter, Registry>;

fn main() -> Result<()> {
    // Initialize logging before anything can log
    let filter_handle = init_logging();

    info!("Starting Area Display Server");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let mut config = config::Config::load()?;
    config.apply_args(&args)?;
    if std::env::var_os("RUST_LOG").is_none() {
        apply_log_filter(&filter_handle, &config.logging)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.server.threads)
        .thread_name("area-server")
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    runtime.block_on(run(config))
}

/// Install the subscriber with `RUST_LOG`, or the default filter until the
/// config has been read.
fn init_logging() -> FilterHandle {
    let filter = EnvFilter::new(
        std::env::var("RUST_LOG").unwrap_or_else(|_| config::LoggingConfig::default().filter),
    );
    let (filter, handle) = reload::Layer::new(filter);
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
    handle
}

/// Switch to the filter from the config file.
fn apply_log_filter(handle: &FilterHandle, logging: &config::LoggingConfig) -> Result<()> {
    handle
        .reload(EnvFilter::new(&logging.filter))
        .context("Failed to apply logging filter")?;
    debug!(filter = %logging.filter, "Logging filter applied");
    Ok(())
}

async fn run(config: config::Config) -> Result<()> {
    let protocols: Vec<Arc<dyn ServerProtocol>> = vec![Arc::new(display_server::protocol())];
    let creator = HandshakingConnectionCreator::new(protocols)
        .with_timeout(config.server.handshake_timeout());

    let socket_path = config.server.socket_path();
    let connector = PublishedSocketConnector::bind(&socket_path, creator, Arc::new(TracingReport))
        .with_context(|| format!("Failed to publish socket at {}", socket_path.display()))?;
    connector.start().context("Failed to start accepting clients")?;

    info!(
        socket_path = %socket_path.display(),
        threads = config.server.threads,
        "Display server ready"
    );

    // Handle SIGTERM and SIGINT
    use tokio::signal::unix::{SignalKind, signal};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
    }

    connector.stop();
    drop(connector);
    info!("Display server stopped");
    Ok(())
}
