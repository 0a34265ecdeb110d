//! `GET /api/stats`: cache and publisher statistics.

use axum::{extract::State, Json};
use kinetic_bridge::PublisherStatsSnapshot;
use kinetic_compute::CacheStatsSnapshot;
use serde::Serialize;

use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsResponse {
    pub publisher_id: String,
    pub cache: CacheStatsSnapshot,
    pub hit_rate: f64,
    pub publisher: PublisherStatsSnapshot,
    pub operations: Vec<String>,
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let cache = state.cache.stats();
    Json(StatsResponse {
        publisher_id: state.publisher.id().to_string(),
        hit_rate: cache.hit_rate(),
        cache,
        publisher: state.publisher.stats(),
        operations: state
            .cache
            .registry()
            .names()
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}
