//! KINETIC API - HTTP and WebSocket Transport
//!
//! Serves the compute cache over HTTP (one-shot invocation and external
//! invalidation) and over WebSocket (subscriptions that push every newer
//! version of a computation). The sample operations in [`samples`] are what
//! the bundled server registers.

pub mod config;
pub mod connection;
pub mod constants;
pub mod error;
pub mod macros;
pub mod protocol;
pub mod routes;
pub mod samples;
pub mod state;
pub mod telemetry;
pub mod ws;

use std::time::Instant;

use kinetic_bridge::{BridgeConfig, Publisher};
use kinetic_compute::{ComputeCache, ComputeConfig};

// Re-export commonly used types
pub use config::{ServerConfig, TransportConfig};
pub use connection::{serve_connection, ConnectionOptions, Outgoing};
pub use error::{ApiError, ApiResult, ErrorCode};
pub use protocol::{ClientFrame, ServerFrame};
pub use routes::create_router;
pub use state::AppState;

/// Wire the sample registry, cache and publisher into application state.
pub fn sample_state(
    compute: ComputeConfig,
    bridge: BridgeConfig,
    transport: TransportConfig,
) -> ApiResult<AppState> {
    let registry = samples::sample_registry_with(compute, Instant::now())?;
    let cache = ComputeCache::new(registry);
    let publisher = Publisher::new(cache, bridge);
    Ok(AppState::new(publisher, transport))
}
