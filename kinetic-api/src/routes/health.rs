//! Health Check Endpoint
//!
//! `GET /health` reports liveness plus a few cheap figures. No
//! authentication is involved.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

// ============================================================================
// TYPES
// ============================================================================

/// Health check response. The handler answering at all is the liveness
/// signal, so the status is always `healthy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HealthDetails>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthDetails {
    pub version: String,
    pub uptime_seconds: u64,
    pub operations: usize,
    pub entries: usize,
    pub publications: u64,
}

// ============================================================================
// HANDLERS
// ============================================================================

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let publisher = state.publisher.stats();
    let response = HealthResponse {
        status: HealthStatus::Healthy,
        details: Some(HealthDetails {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_seconds: state.start_time.elapsed().as_secs(),
            operations: state.cache.registry().len(),
            entries: state.cache.len(),
            publications: publisher.publications,
        }),
    };
    (StatusCode::OK, Json(response))
}
