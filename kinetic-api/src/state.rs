//! Shared application state for Axum routers.

use std::time::Instant;

use kinetic_bridge::Publisher;
use kinetic_compute::ComputeCache;

use crate::config::TransportConfig;

/// Application-wide state shared across all routes.
#[derive(Clone)]
pub struct AppState {
    pub cache: ComputeCache,
    pub publisher: Publisher,
    pub transport: TransportConfig,
    pub start_time: Instant,
}

impl AppState {
    /// Build state around a publisher; the cache is the publisher's own.
    pub fn new(publisher: Publisher, transport: TransportConfig) -> Self {
        Self {
            cache: publisher.cache().clone(),
            publisher,
            transport,
            start_time: Instant::now(),
        }
    }
}

crate::impl_from_ref!(ComputeCache, cache);
crate::impl_from_ref!(Publisher, publisher);
crate::impl_from_ref!(TransportConfig, transport);
crate::impl_from_ref!(Instant, start_time);
