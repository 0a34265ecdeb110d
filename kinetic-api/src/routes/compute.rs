//! Invocation and invalidation over HTTP.
//!
//! `POST /api/compute/:operation` returns `{key, version, value|error}`; the
//! key is what a WebSocket client subscribes to. A cached failure is still a
//! result and comes back with status 200.

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use kinetic_compute::{ComputeCache, InvalidationReport};
use kinetic_core::{PublicationUpdate, Session, Value};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::constants::SESSION_HEADER;
use crate::error::{ApiError, ApiResult};
use crate::protocol::session_from_token;
use crate::state::AppState;
use crate::telemetry::metrics;

// ============================================================================
// TYPES
// ============================================================================

/// Body of an invocation.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeRequest {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub session_token: Option<String>,
}

/// Body of an invalidation. Without `args` every entry of the operation is
/// invalidated.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateRequest {
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    #[serde(default)]
    pub session_token: Option<String>,
}

/// An empty body means the default request.
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> ApiResult<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    Ok(serde_json::from_slice(body)?)
}

/// Body token first, then the `X-Session-Id` header.
fn resolve_session(token: Option<String>, headers: &HeaderMap) -> Option<Session> {
    session_from_token(token).or_else(|| {
        headers
            .get(SESSION_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| session_from_token(Some(value.to_string())))
    })
}

// ============================================================================
// HANDLERS
// ============================================================================

/// POST /api/compute/:operation
pub async fn compute(
    State(cache): State<ComputeCache>,
    Path(operation): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<PublicationUpdate>> {
    let request: ComputeRequest = parse_body(&body)?;
    let session = resolve_session(request.session_token, &headers);

    let outcome = match cache.registry().key_for(&operation, request.args, session) {
        Ok(key) => cache.get_or_compute(&key).await,
        Err(err) => Err(err),
    };

    let recorded = match &outcome {
        Ok(result) if result.is_failure() => "error",
        Ok(_) => "value",
        Err(_) => "rejected",
    };
    if let Some(metrics) = metrics() {
        metrics.record_invocation(&operation, recorded);
    }

    let result = outcome?;
    tracing::debug!(key = %result.key(), version = %result.version(), "Invocation served");
    Ok(Json(PublicationUpdate::from(&result)))
}

/// POST /api/invalidate/:operation
pub async fn invalidate(
    State(cache): State<ComputeCache>,
    Path(operation): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<InvalidationReport>> {
    let request: InvalidateRequest = parse_body(&body)?;
    if !cache.registry().contains(&operation) {
        return Err(ApiError::operation_not_found(&operation));
    }

    let report = match request.args {
        Some(args) => {
            let session = resolve_session(request.session_token, &headers);
            let key = cache.registry().key_for(&operation, args, session)?;
            cache.invalidate(&key)
        }
        None => cache.invalidate_operation(&operation),
    };

    if let Some(metrics) = metrics() {
        metrics.record_invalidation(&operation);
    }
    tracing::info!(
        operation = %operation,
        invalidated = report.len(),
        "External invalidation"
    );
    Ok(Json(report))
}

// ============================================================================
// ROUTER
// ============================================================================

pub fn create_router() -> Router<AppState> {
    Router::new()
        .route("/compute/:operation", post(compute))
        .route("/invalidate/:operation", post(invalidate))
}
