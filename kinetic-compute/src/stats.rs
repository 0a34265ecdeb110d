//! Cache statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters updated by the cache. Relaxed ordering: the numbers are
/// for observation only.
#[derive(Debug, Default)]
pub struct CacheStats {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) joins: AtomicU64,
    pub(crate) productions: AtomicU64,
    pub(crate) failures: AtomicU64,
    pub(crate) invalidations: AtomicU64,
    pub(crate) evictions: AtomicU64,
    pub(crate) stale_write_races: AtomicU64,
    pub(crate) cyclic_rejections: AtomicU64,
}

impl CacheStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Get current snapshot of all counters.
    pub fn snapshot(&self, entry_count: usize) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            joins: self.joins.load(Ordering::Relaxed),
            productions: self.productions.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            stale_write_races: self.stale_write_races.load(Ordering::Relaxed),
            cyclic_rejections: self.cyclic_rejections.load(Ordering::Relaxed),
            entry_count: entry_count as u64,
        }
    }
}

/// Statistics about cache usage at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStatsSnapshot {
    /// Calls answered from a valid entry.
    pub hits: u64,
    /// Calls that started a production.
    pub misses: u64,
    /// Calls that awaited a production already in flight.
    pub joins: u64,
    /// Productions completed (values and failures).
    pub productions: u64,
    /// Productions that completed with a cached failure.
    pub failures: u64,
    /// Entries marked invalidated.
    pub invalidations: u64,
    /// Entries removed by keep-alive or release.
    pub evictions: u64,
    /// Completed productions discarded because a newer version was stored.
    pub stale_write_races: u64,
    /// Calls rejected as cyclic.
    pub cyclic_rejections: u64,
    /// Number of entries currently in cache.
    pub entry_count: u64,
}

impl CacheStatsSnapshot {
    /// Calculate the hit rate (0.0 to 1.0). Joins count as hits.
    pub fn hit_rate(&self) -> f64 {
        let served = self.hits + self.joins;
        let total = served + self.misses;
        if total == 0 {
            0.0
        } else {
            served as f64 / total as f64
        }
    }
}
