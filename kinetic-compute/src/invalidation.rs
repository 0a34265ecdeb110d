//! Invalidation: marking entries stale and propagating to dependents.

use kinetic_core::{ComputationKey, Validity};
use serde::Serialize;
use std::collections::{HashSet, VecDeque};
use tracing::{debug, info};

use crate::cache::ComputeCache;
use crate::stats::CacheStats;

/// Keys marked invalidated by one invalidation pass, in visiting order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    pub invalidated: Vec<ComputationKey>,
}

impl InvalidationReport {
    pub fn len(&self) -> usize {
        self.invalidated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.invalidated.is_empty()
    }

    pub fn contains(&self, key: &ComputationKey) -> bool {
        self.invalidated.contains(key)
    }

    fn merge(&mut self, other: InvalidationReport) {
        for key in other.invalidated {
            if !self.invalidated.contains(&key) {
                self.invalidated.push(key);
            }
        }
    }
}

enum Mark {
    Missing,
    Unchanged,
    /// A stored result was marked invalidated.
    Marked,
    /// A production is running; its result will be stored invalidated.
    InFlight,
}

impl ComputeCache {
    /// Mark `key` and everything that transitively depends on it as
    /// invalidated.
    ///
    /// Each dependent is visited once per pass. Nothing is recomputed here;
    /// observers are told about every marked key. A key without an entry is
    /// left alone.
    pub fn invalidate(&self, key: &ComputationKey) -> InvalidationReport {
        if !self.inner.entries.contains_key(key) {
            debug!(key = %key, "Invalidation of unknown key ignored");
            return InvalidationReport::default();
        }

        let mut visited = HashSet::from([key.clone()]);
        let mut queue = VecDeque::from([key.clone()]);
        let mut report = InvalidationReport::default();
        let mut marked = Vec::new();

        while let Some(next) = queue.pop_front() {
            match self.mark(&next) {
                Mark::Marked => {
                    marked.push(next.clone());
                    report.invalidated.push(next.clone());
                }
                Mark::InFlight => report.invalidated.push(next.clone()),
                Mark::Missing | Mark::Unchanged => {}
            }
            for dependent in self.inner.graph.dependents_of(&next) {
                if visited.insert(dependent.clone()) {
                    queue.push_back(dependent);
                }
            }
        }

        // Recomputation records fresh edges.
        for stale in &marked {
            self.inner.graph.clear_dependencies(stale);
        }

        CacheStats::add(&self.inner.stats.invalidations, report.len());
        if !report.is_empty() {
            debug!(key = %key, invalidated = report.len(), "Invalidation pass completed");
        }
        self.notify_invalidated(&marked);
        report
    }

    /// Invalidate every entry of one operation.
    pub fn invalidate_operation(&self, operation: &str) -> InvalidationReport {
        let roots: Vec<ComputationKey> = self
            .inner
            .entries
            .iter()
            .filter(|entry| entry.key().operation() == operation)
            .map(|entry| entry.key().clone())
            .collect();

        let mut report = InvalidationReport::default();
        for root in &roots {
            report.merge(self.invalidate(root));
        }

        if !report.is_empty() {
            info!(
                operation,
                roots = roots.len(),
                invalidated = report.len(),
                "Invalidated operation"
            );
        }
        report
    }

    fn mark(&self, key: &ComputationKey) -> Mark {
        let Some(mut entry) = self.inner.entries.get_mut(key) else {
            return Mark::Missing;
        };
        entry.epoch = entry.epoch.wrapping_add(1);

        if entry.in_flight.is_some() {
            Mark::InFlight
        } else if entry.validity.is_valid() {
            entry.validity = Validity::Invalidated;
            Mark::Marked
        } else {
            Mark::Unchanged
        }
    }
}
