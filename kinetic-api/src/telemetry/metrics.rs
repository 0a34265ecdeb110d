//! Prometheus Metrics Definitions
//!
//! Defines all KINETIC metrics and exposes a /metrics endpoint for
//! Prometheus scraping.

use axum::{extract::State, http::StatusCode, response::IntoResponse};
use kinetic_bridge::PublisherStatsSnapshot;
use kinetic_compute::CacheStatsSnapshot;
use once_cell::sync::Lazy;
use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Encoder, Gauge, GaugeVec, HistogramVec, TextEncoder,
};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// HTTP request latency buckets (seconds)
const HTTP_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.010, 0.025, 0.050, 0.100, 0.250, 0.500, 1.0, 2.5, 5.0, 10.0,
];

/// Global metrics instance - initialized once at startup
pub static METRICS: Lazy<ApiResult<KineticMetrics>> = Lazy::new(KineticMetrics::new);

/// The registered metrics, or None when registration failed.
pub fn metrics() -> Option<&'static KineticMetrics> {
    METRICS.as_ref().ok()
}

/// Container for all KINETIC metrics.
#[derive(Clone)]
pub struct KineticMetrics {
    /// HTTP request counter - labels: method, path, status
    pub http_requests_total: CounterVec,

    /// HTTP request duration histogram - labels: method, path
    pub http_request_duration_seconds: HistogramVec,

    /// Invocations over HTTP - labels: operation, outcome (value/error/rejected)
    pub invocations_total: CounterVec,

    /// External invalidations - labels: operation
    pub invalidations_total: CounterVec,

    /// Update frames queued to WebSocket clients
    pub pushes_total: CounterVec,

    /// Current active WebSocket connections
    pub websocket_connections: Gauge,

    /// Cache counters mirrored from the cache statistics - labels: stat
    pub cache: GaugeVec,

    /// Publisher counters mirrored from the publisher statistics - labels: stat
    pub publisher: GaugeVec,
}

fn registration_error(name: &str, err: prometheus::Error) -> ApiError {
    ApiError::internal_error(format!("Failed to register {}: {}", name, err))
}

impl KineticMetrics {
    /// Create and register all metrics with Prometheus.
    pub fn new() -> ApiResult<Self> {
        Ok(Self {
            http_requests_total: register_counter_vec!(
                "kinetic_http_requests_total",
                "Total number of HTTP requests",
                &["method", "path", "status"]
            )
            .map_err(|e| registration_error("http_requests_total", e))?,

            http_request_duration_seconds: register_histogram_vec!(
                "kinetic_http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path"],
                HTTP_LATENCY_BUCKETS.to_vec()
            )
            .map_err(|e| registration_error("http_request_duration_seconds", e))?,

            invocations_total: register_counter_vec!(
                "kinetic_invocations_total",
                "Total number of HTTP invocations",
                &["operation", "outcome"]
            )
            .map_err(|e| registration_error("invocations_total", e))?,

            invalidations_total: register_counter_vec!(
                "kinetic_invalidations_total",
                "Total number of external invalidation requests",
                &["operation"]
            )
            .map_err(|e| registration_error("invalidations_total", e))?,

            pushes_total: register_counter_vec!(
                "kinetic_pushes_total",
                "Total number of update frames queued to WebSocket clients",
                &["operation"]
            )
            .map_err(|e| registration_error("pushes_total", e))?,

            websocket_connections: register_gauge!(
                "kinetic_websocket_connections",
                "Current number of active WebSocket connections"
            )
            .map_err(|e| registration_error("websocket_connections", e))?,

            cache: register_gauge_vec!(
                "kinetic_cache",
                "Compute cache statistics",
                &["stat"]
            )
            .map_err(|e| registration_error("cache", e))?,

            publisher: register_gauge_vec!(
                "kinetic_publisher",
                "Publisher statistics",
                &["stat"]
            )
            .map_err(|e| registration_error("publisher", e))?,
        })
    }

    /// Record an HTTP request.
    pub fn record_http_request(&self, method: &str, path: &str, status: u16, duration_secs: f64) {
        let status_str = status.to_string();
        self.http_requests_total
            .with_label_values(&[method, path, &status_str])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, path])
            .observe(duration_secs);
    }

    /// Record an HTTP invocation.
    pub fn record_invocation(&self, operation: &str, outcome: &str) {
        self.invocations_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    pub fn record_invalidation(&self, operation: &str) {
        self.invalidations_total.with_label_values(&[operation]).inc();
    }

    pub fn record_push(&self, operation: &str) {
        self.pushes_total.with_label_values(&[operation]).inc();
    }

    /// Increment WebSocket connection count.
    pub fn ws_connected(&self) {
        self.websocket_connections.inc();
    }

    /// Decrement WebSocket connection count.
    pub fn ws_disconnected(&self) {
        self.websocket_connections.dec();
    }

    /// Mirror cache and publisher statistics into their gauges.
    pub fn observe_stats(&self, cache: &CacheStatsSnapshot, publisher: &PublisherStatsSnapshot) {
        let cache_values = [
            ("hits", cache.hits),
            ("misses", cache.misses),
            ("joins", cache.joins),
            ("productions", cache.productions),
            ("failures", cache.failures),
            ("invalidations", cache.invalidations),
            ("evictions", cache.evictions),
            ("stale_write_races", cache.stale_write_races),
            ("cyclic_rejections", cache.cyclic_rejections),
            ("entries", cache.entry_count),
        ];
        for (stat, value) in cache_values {
            self.cache.with_label_values(&[stat]).set(value as f64);
        }

        let publisher_values = [
            ("subscriptions_opened", publisher.subscriptions_opened),
            ("subscriptions_closed", publisher.subscriptions_closed),
            ("updates_pushed", publisher.updates_pushed),
            ("deliveries_failed", publisher.deliveries_failed),
            ("refreshes", publisher.refreshes),
            ("publications", publisher.publications),
            ("channels", publisher.channels),
        ];
        for (stat, value) in publisher_values {
            self.publisher.with_label_values(&[stat]).set(value as f64);
        }
    }
}

/// Handler for GET /metrics endpoint.
///
/// Returns Prometheus text format metrics.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    if let Some(metrics) = metrics() {
        metrics.observe_stats(&state.cache.stats(), &state.publisher.stats());
    }

    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [("content-type", "text/plain")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}
