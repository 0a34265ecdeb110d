//! Publisher statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct PublisherStats {
    pub(crate) subscriptions_opened: AtomicU64,
    pub(crate) subscriptions_closed: AtomicU64,
    pub(crate) updates_pushed: AtomicU64,
    pub(crate) deliveries_failed: AtomicU64,
    pub(crate) refreshes: AtomicU64,
}

impl PublisherStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, publications: usize, channels: usize) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            subscriptions_opened: self.subscriptions_opened.load(Ordering::Relaxed),
            subscriptions_closed: self.subscriptions_closed.load(Ordering::Relaxed),
            updates_pushed: self.updates_pushed.load(Ordering::Relaxed),
            deliveries_failed: self.deliveries_failed.load(Ordering::Relaxed),
            refreshes: self.refreshes.load(Ordering::Relaxed),
            publications: publications as u64,
            channels: channels as u64,
        }
    }
}

/// Publisher statistics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStatsSnapshot {
    pub subscriptions_opened: u64,
    pub subscriptions_closed: u64,
    /// Updates delivered by forwarders after the initial value.
    pub updates_pushed: u64,
    /// Deliveries that found the channel closed.
    pub deliveries_failed: u64,
    /// Recomputations triggered by invalidation of an active publication.
    pub refreshes: u64,
    pub publications: u64,
    pub channels: u64,
}
