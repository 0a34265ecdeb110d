//! Router assembly.
//!
//! ```text
//! GET  /ws                       WebSocket subscriptions
//! POST /api/compute/:operation   invoke, returns {key, version, value|error}
//! POST /api/invalidate/:operation
//! GET  /api/stats
//! GET  /health
//! GET  /metrics                  Prometheus text format
//! ```
//!
//! Layers, outermost first: CORS, then observability.

pub mod compute;
pub mod health;
pub mod stats;

use std::time::Duration;

use axum::{
    http::{header, HeaderName, HeaderValue, Method},
    middleware::from_fn,
    routing::get,
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::config::ServerConfig;
use crate::constants::{CORS_MAX_AGE_SECS, SESSION_HEADER};
use crate::state::AppState;
use crate::telemetry::{metrics_handler, observability_middleware};
use crate::ws::ws_handler;

/// Build the full application router.
pub fn create_router(state: AppState, config: &ServerConfig) -> Router {
    let api_routes = compute::create_router().route("/stats", get(stats::stats));

    Router::new()
        .nest("/api", api_routes)
        .route("/ws", get(ws_handler))
        .route("/health", get(health::health))
        .route("/metrics", get(metrics_handler))
        .layer(from_fn(observability_middleware))
        .layer(build_cors_layer(config))
        .with_state(state)
}

fn build_cors_layer(config: &ServerConfig) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            HeaderName::from_static(SESSION_HEADER),
        ])
        .max_age(Duration::from_secs(CORS_MAX_AGE_SECS));

    if config.cors_origins.is_empty() {
        tracing::info!("CORS: Development mode - allowing all origins");
        cors.allow_origin(Any)
    } else {
        tracing::info!(
            "CORS: Production mode - allowing origins: {:?}",
            config.cors_origins
        );
        let origins: Vec<HeaderValue> = config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        cors.allow_origin(origins)
    }
}
