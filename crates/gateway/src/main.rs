//! Gateway service entry point.
//!
//! WebSocket fan-out gateway over Redis streams.

use anyhow::Result;
use fanout_gateway::{create_router, AppState, GatewayConfig, Hub};
use log_store::{RedisLogStore, SharedLogStore};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Gateway service");

    let config = GatewayConfig::from_env()?;
    info!("Configuration:");
    info!("  REDIS_URL: {}", config.redis_url);
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!("  SEND_TIMEOUT: {:?}", config.hub.topic.send_timeout);
    info!("  BLOCK_TIMEOUT: {:?}", config.hub.topic.reader.block_timeout);

    // Start Prometheus metrics server
    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    // Connect to the log store
    info!("Connecting to Redis at {}", config.redis_url);
    let store: SharedLogStore = Arc::new(RedisLogStore::connect(&config.redis_url).await?);
    info!("Connected to Redis");

    // Spawn the hub
    let shutdown = CancellationToken::new();
    let (hub, hub_handle) = Hub::new(store, config.hub.clone(), shutdown.clone());
    let hub_task = tokio::spawn(hub.run());

    let state = Arc::new(AppState::new(hub_handle, config.client.clone()));
    let app = create_router(state);

    // Start HTTP server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the hub and every topic under it
    info!("Shutting down hub...");
    shutdown.cancel();
    if let Err(e) = hub_task.await {
        error!("Hub task failed: {:?}", e);
    }

    info!("Gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
