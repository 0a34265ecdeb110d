//! KINETIC API Server Entry Point
//!
//! Loads configuration from the environment, registers the sample
//! operations, starts the keep-alive sweeper and the clock, then serves HTTP
//! and WebSocket traffic until Ctrl-C.

use axum::Router;
use kinetic_api::samples::time_ticker;
use kinetic_api::telemetry::{init_tracing, TelemetryConfig};
use kinetic_api::{
    create_router, sample_state, ApiError, ApiResult, ServerConfig, TransportConfig,
};
use kinetic_bridge::BridgeConfig;
use kinetic_compute::{keep_alive_task, ComputeConfig, KeepAliveConfig};
use tokio::sync::watch;

#[tokio::main]
async fn main() -> ApiResult<()> {
    let telemetry_config = TelemetryConfig::default();
    init_tracing(&telemetry_config)?;

    let server_config = ServerConfig::from_env()?;
    let transport_config = TransportConfig::from_env()?;
    let state = sample_state(
        ComputeConfig::from_env()?,
        BridgeConfig::from_env()?,
        transport_config,
    )?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sweeper = tokio::spawn(keep_alive_task(
        state.cache.clone(),
        KeepAliveConfig::from_env(),
        shutdown_rx.clone(),
    ));
    let ticker = tokio::spawn(time_ticker(
        state.cache.clone(),
        server_config.time_tick,
        shutdown_rx,
    ));

    let publisher_id = state.publisher.id();
    let app: Router = create_router(state, &server_config);

    let addr = server_config.socket_addr()?;
    tracing::info!(%addr, %publisher_id, "Starting KINETIC API server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| ApiError::internal_error(format!("Failed to bind {}: {}", addr, e)))?;

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown signal received");
        })
        .await
        .map_err(|e| ApiError::internal_error(format!("Server error: {}", e)))?;

    let _ = shutdown_tx.send(true);
    if let Err(e) = sweeper.await {
        tracing::warn!(error = %e, "Keep-alive task ended abnormally");
    }
    if let Err(e) = ticker.await {
        tracing::warn!(error = %e, "Time ticker ended abnormally");
    }

    tracing::info!("KINETIC API server stopped");
    Ok(())
}
