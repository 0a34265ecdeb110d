//! Keep-Alive Sweeper
//!
//! Every operation declares how long its results stay cached after their
//! last use. This module removes entries whose keep-alive has run out:
//!
//! - [`ComputeCache::sweep`] performs one pass over the cache
//! - [`keep_alive_task`] runs sweeps on a fixed interval until shutdown
//!
//! An entry is only evicted when no production for it is running, nothing
//! depends on it and no observer (the publication bridge) retains it.
//! Dependencies freed by an eviction are evicted immediately when their own
//! keep-alive is zero, otherwise on a later pass once they expire.
//!
//! # Usage
//!
//! ```ignore
//! use kinetic_compute::{keep_alive_task, KeepAliveConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(keep_alive_task(cache.clone(), KeepAliveConfig::from_env(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

use kinetic_core::ComputationKey;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::cache::{ComputeCache, Entry};
use crate::constants::DEFAULT_SWEEP_INTERVAL_MS;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the keep-alive background task.
#[derive(Debug, Clone)]
pub struct KeepAliveConfig {
    /// How often to sweep expired entries (default: 1 second)
    pub sweep_interval: Duration,

    /// Whether to log each evicted key (default: false)
    pub log_evictions: bool,
}

impl Default for KeepAliveConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_millis(DEFAULT_SWEEP_INTERVAL_MS),
            log_evictions: false,
        }
    }
}

impl KeepAliveConfig {
    /// Create KeepAliveConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `KINETIC_SWEEP_INTERVAL_MS`: Interval between sweeps (default: 1000)
    /// - `KINETIC_LOG_EVICTIONS`: Whether to log each eviction (default: false)
    pub fn from_env() -> Self {
        let sweep_interval = Duration::from_millis(
            std::env::var("KINETIC_SWEEP_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|ms| *ms > 0)
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_MS),
        );

        let log_evictions = std::env::var("KINETIC_LOG_EVICTIONS")
            .ok()
            .map(|s| s.to_lowercase() == "true")
            .unwrap_or(false);

        Self {
            sweep_interval,
            log_evictions,
        }
    }

    /// Create a configuration for development/testing with a short interval.
    pub fn development() -> Self {
        Self {
            sweep_interval: Duration::from_millis(100),
            log_evictions: true,
        }
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for keep-alive activity since the task started.
#[derive(Debug, Default)]
pub struct KeepAliveMetrics {
    /// Total sweeps completed
    pub sweep_cycles: AtomicU64,

    /// Total entries evicted by sweeps
    pub entries_evicted: AtomicU64,
}

impl KeepAliveMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> KeepAliveSnapshot {
        KeepAliveSnapshot {
            sweep_cycles: self.sweep_cycles.load(Ordering::Relaxed),
            entries_evicted: self.entries_evicted.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of keep-alive metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeepAliveSnapshot {
    pub sweep_cycles: u64,
    pub entries_evicted: u64,
}

/// Keys evicted by one sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<ComputationKey>,
}

// ============================================================================
// SWEEP
// ============================================================================

fn expired(entry: &Entry, now: Instant) -> bool {
    entry.in_flight.is_none()
        && now.saturating_duration_since(entry.last_accessed) > entry.keep_alive.ttl()
}

impl ComputeCache {
    /// Evict every entry idle for longer than its keep-alive.
    pub fn sweep(&self) -> SweepReport {
        let now = Instant::now();
        let candidates: Vec<ComputationKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| expired(entry.value(), now))
            .map(|entry| entry.key().clone())
            .collect();

        let mut report = SweepReport::default();
        for key in candidates {
            // Re-checked under the shard lock: the entry may have been used since.
            if let Some(dependencies) = self.evict_if(&key, |entry| expired(entry, now)) {
                report.evicted.push(key);
                for dependency in dependencies {
                    report.evicted.extend(self.release(&dependency));
                }
            }
        }
        report
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that sweeps the cache until the shutdown signal is
/// received.
///
/// # Returns
///
/// Metrics collected during the task's lifetime
pub async fn keep_alive_task(
    cache: ComputeCache,
    config: KeepAliveConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<KeepAliveMetrics> {
    let metrics = Arc::new(KeepAliveMetrics::new());

    let mut sweep_interval = interval(config.sweep_interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        sweep_interval_ms = config.sweep_interval.as_millis() as u64,
        "Keep-alive task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender also means shutdown.
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Keep-alive task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                run_sweep(&cache, &config, &metrics);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweep_cycles = snapshot.sweep_cycles,
        entries_evicted = snapshot.entries_evicted,
        "Keep-alive task completed"
    );

    metrics
}

fn run_sweep(cache: &ComputeCache, config: &KeepAliveConfig, metrics: &KeepAliveMetrics) {
    metrics.sweep_cycles.fetch_add(1, Ordering::Relaxed);

    let report = cache.sweep();
    metrics
        .entries_evicted
        .fetch_add(report.evicted.len() as u64, Ordering::Relaxed);

    if config.log_evictions {
        for key in &report.evicted {
            tracing::info!(key = %key, "Evicted expired entry");
        }
    }

    if report.evicted.is_empty() {
        tracing::trace!("Keep-alive sweep completed with nothing to evict");
    } else {
        tracing::debug!(
            evicted = report.evicted.len(),
            remaining = cache.len(),
            "Keep-alive sweep completed"
        );
    }
}
