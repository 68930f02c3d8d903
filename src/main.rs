//! rthrift - Thrift RPC server
//!
//! Serves the built-in `Search` service over the configured transport and protocol.

mod search;

use rthrift_server::{Config, Server};
use search::SearchService;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Load configuration (from file if RTHRIFT_CONFIG is set, then env overrides)
    let config_path = std::env::var("RTHRIFT_CONFIG").ok();
    let config = match Config::load() {
        Ok(c) => {
            if let Some(path) = &config_path {
                tracing::info!("Loaded config from {}", path);
            }
            c
        }
        Err(e) => {
            // If a config file was explicitly specified, fail on error
            if config_path.is_some() {
                tracing::error!("Failed to load config: {}", e);
                return Err(e.into());
            }
            tracing::info!("Using default configuration");
            Config::default()
        }
    };

    tracing::info!("Starting rthrift server");
    tracing::info!("  Bind address: {}", config.network.bind_addr);
    tracing::info!("  Transport: {}", config.protocol.transport);
    tracing::info!(
        "  Protocol: {} (auto-detect {})",
        config.protocol.protocol,
        if config.protocol.auto_detect {
            "on"
        } else {
            "off"
        }
    );
    match config.network.idle_timeout() {
        Some(timeout) => tracing::info!("  Idle timeout: {}s", timeout.as_secs()),
        None => tracing::info!("  Idle timeout: disabled"),
    }
    tracing::info!("  Max connections: {}", config.network.max_connections);

    let server = Arc::new(Server::new(
        config.server_config(),
        SearchService::default(),
    ));

    // Spawn shutdown signal handler
    let shutdown_server = server.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Received shutdown signal, stopping server...");
        shutdown_server.shutdown();
    });

    // Run server (blocks until shutdown)
    server.run().await?;

    let stats = server.stats();
    tracing::info!(
        "Server stopped ({} connections, {} requests)",
        stats
            .connections_total
            .load(std::sync::atomic::Ordering::Relaxed),
        stats.requests_total.load(std::sync::atomic::Ordering::Relaxed)
    );
    Ok(())
}
