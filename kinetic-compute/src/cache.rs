//! Memoizing compute cache.
//!
//! Entries live in a sharded `DashMap` keyed by [`ComputationKey`]. A miss
//! starts one production task per key; every concurrent caller for that key
//! awaits the same task through a `watch` channel, so the producer runs at
//! most once at a time per key and a caller that gives up only detaches
//! itself.
//!
//! Versions are assigned when a production starts, from a per-entry counter,
//! so results of one live entry are strictly ordered. Invalidation bumps the
//! entry's epoch; a production that started under an older epoch is stored
//! already invalidated.

use dashmap::mapref::entry::Entry as MapEntry;
use dashmap::DashMap;
use futures_util::FutureExt;
use kinetic_core::{
    CachedResult, ComputationKey, ComputeError, ComputeResult, KeepAlive, ProductionFailure,
    Session, Validity, Version,
};
use serde_json::Value;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, Weak};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::context::{ComputeContext, Frame};
use crate::graph::DependencyGraph;
use crate::observer::CacheObserver;
use crate::registry::{OperationRegistry, Producer};
use crate::stats::{CacheStats, CacheStatsSnapshot};

pub(crate) type Outcome = ComputeResult<Arc<CachedResult>>;

/// Mutable state of one cached key.
pub(crate) struct Entry {
    pub(crate) result: Option<Arc<CachedResult>>,
    pub(crate) validity: Validity,
    /// Highest version handed out to a production of this entry.
    pub(crate) version: Version,
    pub(crate) keep_alive: KeepAlive,
    pub(crate) last_accessed: Instant,
    /// Bumped by every invalidation that reaches this entry.
    pub(crate) epoch: u64,
    pub(crate) in_flight: Option<InFlight>,
}

impl Entry {
    fn new(keep_alive: KeepAlive, now: Instant) -> Self {
        Self {
            result: None,
            validity: Validity::Invalidated,
            version: Version::ZERO,
            keep_alive,
            last_accessed: now,
            epoch: 0,
            in_flight: None,
        }
    }
}

#[derive(Clone)]
pub(crate) struct InFlight {
    production: u64,
    /// Entry epoch when the production started.
    epoch: u64,
    receiver: watch::Receiver<Option<Outcome>>,
}

/// Read-only view of an entry.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    pub result: Option<Arc<CachedResult>>,
    pub validity: Validity,
    pub keep_alive: KeepAlive,
    pub last_accessed: Instant,
    pub in_flight: bool,
}

impl EntrySnapshot {
    /// Version of the stored result, `Version::ZERO` when nothing is stored yet.
    pub fn version(&self) -> Version {
        self.result
            .as_ref()
            .map(|r| r.version())
            .unwrap_or(Version::ZERO)
    }
}

pub(crate) struct CacheInner {
    pub(crate) registry: OperationRegistry,
    pub(crate) entries: DashMap<ComputationKey, Entry>,
    pub(crate) graph: DependencyGraph,
    pub(crate) stats: CacheStats,
    observers: RwLock<Vec<Weak<dyn CacheObserver>>>,
    next_production: AtomicU64,
}

/// Shared handle to the compute cache. Clones refer to the same cache.
#[derive(Clone)]
pub struct ComputeCache {
    pub(crate) inner: Arc<CacheInner>,
}

enum Lookup {
    Hit(Arc<CachedResult>),
    Wait(watch::Receiver<Option<Outcome>>),
    /// The running production started before an invalidation; wait for it
    /// to finish, then look again.
    Outdated(watch::Receiver<Option<Outcome>>),
}

/// Everything a spawned production needs.
struct Production {
    key: ComputationKey,
    id: u64,
    version: Version,
    epoch: u64,
    frame: Arc<Frame>,
    producer: Arc<dyn Producer>,
}

impl ComputeCache {
    pub fn new(registry: OperationRegistry) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                registry,
                entries: DashMap::new(),
                graph: DependencyGraph::new(),
                stats: CacheStats::default(),
                observers: RwLock::new(Vec::new()),
                next_production: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.inner.registry
    }

    /// Register an observer. Dropped observers are pruned lazily.
    pub fn add_observer(&self, observer: Weak<dyn CacheObserver>) {
        self.inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(observer);
    }

    /// Invoke an operation from outside any production and return its value.
    pub async fn invoke(
        &self,
        operation: &str,
        args: Vec<Value>,
        session: Option<Session>,
    ) -> ComputeResult<Value> {
        let key = self.inner.registry.key_for(operation, args, session)?;
        let result = self.get_or_compute(&key).await?;
        match result.output() {
            Ok(value) => Ok(value.clone()),
            Err(failure) => Err(ComputeError::Production(failure.clone())),
        }
    }

    /// Return the valid result for `key`, producing it if needed.
    ///
    /// Cached failures come back as `Ok` results carrying the failure, so the
    /// caller sees the version it belongs to. Entries with no keep-alive are
    /// released right away when nothing else references them.
    pub async fn get_or_compute(&self, key: &ComputationKey) -> ComputeResult<Arc<CachedResult>> {
        let outcome = self.resolve(key, None).await;
        self.release(key);
        outcome
    }

    /// Resolve `key`, recording it as a dependency of `caller` when given.
    pub(crate) async fn resolve(
        &self,
        key: &ComputationKey,
        caller: Option<&Arc<Frame>>,
    ) -> ComputeResult<Arc<CachedResult>> {
        let descriptor = self.inner.registry.get(key.operation())?;
        let keep_alive = descriptor.keep_alive();
        let producer = descriptor.producer();

        if let Some(frame) = caller {
            if frame.chain().contains(key) || self.inner.graph.depends_on(key, frame.key()) {
                CacheStats::bump(&self.inner.stats.cyclic_rejections);
                let chain = frame.chain_to(key);
                debug!(key = %key, chain = ?chain, "Rejected cyclic dependency");
                return Err(ComputeError::CyclicDependency { chain });
            }
            self.inner.graph.add_edge(frame.key(), key);
            frame.record(key);
        }

        loop {
            match self.lookup_or_start(key, keep_alive, Arc::clone(&producer), caller) {
                Lookup::Hit(result) => return Ok(result),
                Lookup::Wait(receiver) => return wait_for_outcome(key, receiver).await,
                Lookup::Outdated(receiver) => {
                    // Its result is stored invalidated; the next pass starts
                    // a fresh production.
                    let _ = wait_for_outcome(key, receiver).await;
                }
            }
        }
    }

    fn lookup_or_start(
        &self,
        key: &ComputationKey,
        keep_alive: KeepAlive,
        producer: Arc<dyn Producer>,
        caller: Option<&Arc<Frame>>,
    ) -> Lookup {
        let now = Instant::now();
        let mut entry = self
            .inner
            .entries
            .entry(key.clone())
            .or_insert_with(|| Entry::new(keep_alive, now));
        entry.last_accessed = now;

        if let Some(in_flight) = &entry.in_flight {
            if in_flight.epoch != entry.epoch {
                debug!(key = %key, "Waiting out a production started before invalidation");
                return Lookup::Outdated(in_flight.receiver.clone());
            }
            CacheStats::bump(&self.inner.stats.joins);
            return Lookup::Wait(in_flight.receiver.clone());
        }

        if entry.validity.is_valid() {
            if let Some(result) = &entry.result {
                CacheStats::bump(&self.inner.stats.hits);
                return Lookup::Hit(Arc::clone(result));
            }
        }

        CacheStats::bump(&self.inner.stats.misses);
        let version = entry.version.next();
        entry.version = version;
        let id = self.inner.next_production.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = watch::channel(None);
        entry.in_flight = Some(InFlight {
            production: id,
            epoch: entry.epoch,
            receiver: receiver.clone(),
        });
        let epoch = entry.epoch;
        drop(entry);

        // Dependencies are re-recorded by this production.
        self.inner.graph.clear_dependencies(key);

        debug!(key = %key, version = %version, "Starting production");
        self.spawn_production(
            Production {
                key: key.clone(),
                id,
                version,
                epoch,
                frame: Arc::new(Frame::new(caller.map(|parent| &**parent), key.clone())),
                producer,
            },
            sender,
        );
        Lookup::Wait(receiver)
    }

    fn spawn_production(&self, production: Production, sender: watch::Sender<Option<Outcome>>) {
        let cache = self.clone();
        tokio::spawn(async move {
            let mut guard = ProductionGuard {
                cache: cache.clone(),
                key: production.key.clone(),
                id: production.id,
                armed: true,
            };

            let ctx = ComputeContext::new(cache.clone(), Arc::clone(&production.frame));
            let args = production.key.args().to_vec();
            let produced = AssertUnwindSafe(production.producer.produce(ctx, args))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    warn!(key = %production.key, panic = %message, "Producer panicked");
                    Err(ComputeError::failed(format!("producer panicked: {message}")))
                });

            let outcome = cache.complete(&production, produced);
            guard.armed = false;
            // Nobody waiting is fine: the result is already stored.
            let _ = sender.send(Some(outcome));
        });
    }

    /// Store the outcome of a finished production.
    fn complete(&self, production: &Production, produced: ComputeResult<Value>) -> Outcome {
        let key = &production.key;
        let output = match produced {
            Ok(value) => Ok(value),
            Err(err) if err.is_cyclic() => {
                self.abandon(key, production.id);
                return Err(err);
            }
            Err(ComputeError::Production(failure)) => Err(failure),
            Err(other) => Err(ProductionFailure::new(other.to_string())),
        };
        let failed = output.is_err();
        let result = Arc::new(CachedResult::new(
            key.clone(),
            production.version,
            output,
            production.frame.take_dependencies(),
        ));

        let mut stale_on_arrival = false;
        let stored = match self.inner.entries.get_mut(key) {
            Some(mut entry) => {
                if entry
                    .in_flight
                    .as_ref()
                    .is_some_and(|f| f.production == production.id)
                {
                    entry.in_flight = None;
                }

                let newer = entry
                    .result
                    .as_ref()
                    .filter(|existing| existing.version() >= production.version)
                    .cloned();
                match newer {
                    Some(existing) => {
                        CacheStats::bump(&self.inner.stats.stale_write_races);
                        warn!(
                            key = %key,
                            stored = %existing.version(),
                            discarded = %production.version,
                            "Discarded stale production result"
                        );
                        existing
                    }
                    None => {
                        stale_on_arrival = entry.epoch != production.epoch;
                        entry.validity = if stale_on_arrival {
                            Validity::Invalidated
                        } else {
                            Validity::Valid
                        };
                        entry.result = Some(Arc::clone(&result));
                        entry.last_accessed = Instant::now();
                        result
                    }
                }
            }
            None => result,
        };

        CacheStats::bump(&self.inner.stats.productions);
        if failed {
            CacheStats::bump(&self.inner.stats.failures);
        }
        debug!(
            key = %key,
            version = %production.version,
            failed,
            stale_on_arrival,
            "Production completed"
        );

        if stale_on_arrival {
            CacheStats::bump(&self.inner.stats.invalidations);
            self.notify_invalidated(std::slice::from_ref(key));
        }
        Ok(stored)
    }

    /// Forget a production that will not store a result.
    fn abandon(&self, key: &ComputationKey, production: u64) {
        let orphaned = match self.inner.entries.entry(key.clone()) {
            MapEntry::Occupied(mut occupied) => {
                let orphaned = {
                    let entry = occupied.get_mut();
                    if entry
                        .in_flight
                        .as_ref()
                        .is_some_and(|f| f.production == production)
                    {
                        entry.in_flight = None;
                    }
                    entry.result.is_none() && entry.in_flight.is_none()
                };
                if orphaned {
                    occupied.remove();
                }
                orphaned
            }
            MapEntry::Vacant(_) => false,
        };
        if orphaned {
            self.inner.graph.clear_dependencies(key);
        }
    }

    /// Mark an entry as used now. Returns false when the key has no entry.
    pub fn touch(&self, key: &ComputationKey) -> bool {
        match self.inner.entries.get_mut(key) {
            Some(mut entry) => {
                entry.last_accessed = Instant::now();
                true
            }
            None => false,
        }
    }

    /// The stored result for `key`, valid or not, without producing anything.
    pub fn peek(&self, key: &ComputationKey) -> Option<Arc<CachedResult>> {
        self.inner
            .entries
            .get(key)
            .and_then(|entry| entry.result.clone())
    }

    pub fn entry(&self, key: &ComputationKey) -> Option<EntrySnapshot> {
        self.inner.entries.get(key).map(|entry| EntrySnapshot {
            result: entry.result.clone(),
            validity: entry.validity,
            keep_alive: entry.keep_alive,
            last_accessed: entry.last_accessed,
            in_flight: entry.in_flight.is_some(),
        })
    }

    pub fn contains(&self, key: &ComputationKey) -> bool {
        self.inner.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn keys(&self) -> Vec<ComputationKey> {
        self.inner
            .entries
            .iter()
            .map(|entry| entry.key().clone())
            .collect()
    }

    pub fn dependencies_of(&self, key: &ComputationKey) -> Vec<ComputationKey> {
        self.inner.graph.dependencies_of(key)
    }

    pub fn dependents_of(&self, key: &ComputationKey) -> Vec<ComputationKey> {
        self.inner.graph.dependents_of(key)
    }

    pub fn stats(&self) -> CacheStatsSnapshot {
        self.inner.stats.snapshot(self.inner.entries.len())
    }

    /// Evict `key` if it has no keep-alive and nothing references it, then
    /// do the same for the dependencies it leaves unreferenced.
    ///
    /// Returns the evicted keys.
    pub fn release(&self, key: &ComputationKey) -> Vec<ComputationKey> {
        let mut released = Vec::new();
        let mut pending = vec![key.clone()];
        while let Some(next) = pending.pop() {
            if let Some(dependencies) = self.evict_if(&next, |entry| entry.keep_alive.is_none()) {
                released.push(next);
                pending.extend(dependencies);
            }
        }
        released
    }

    /// Evict `key` regardless of its keep-alive, unless it is in flight,
    /// has dependents or is retained by an observer.
    pub fn evict(&self, key: &ComputationKey) -> bool {
        match self.evict_if(key, |_| true) {
            Some(dependencies) => {
                for dependency in dependencies {
                    self.release(&dependency);
                }
                true
            }
            None => false,
        }
    }

    /// Remove `key` when `eligible` holds and nothing references it.
    ///
    /// The check and the removal happen under the entry's shard lock, so a
    /// concurrent caller either sees the entry or creates a fresh one.
    /// Returns the evicted entry's former dependencies.
    pub(crate) fn evict_if(
        &self,
        key: &ComputationKey,
        eligible: impl FnOnce(&Entry) -> bool,
    ) -> Option<Vec<ComputationKey>> {
        let dependencies = match self.inner.entries.entry(key.clone()) {
            MapEntry::Occupied(occupied) => {
                let entry = occupied.get();
                if entry.in_flight.is_some()
                    || !eligible(entry)
                    || self.inner.graph.has_dependents(key)
                    || self.is_retained(key)
                {
                    return None;
                }
                let dependencies = self.inner.graph.clear_dependencies(key);
                occupied.remove();
                dependencies
            }
            MapEntry::Vacant(_) => return None,
        };

        CacheStats::bump(&self.inner.stats.evictions);
        debug!(key = %key, "Evicted entry");
        self.notify_evicted(key);
        Some(dependencies)
    }

    fn is_retained(&self, key: &ComputationKey) -> bool {
        self.inner
            .observers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(Weak::upgrade)
            .any(|observer| observer.retains(key))
    }

    fn observers(&self) -> Vec<Arc<dyn CacheObserver>> {
        let mut observers = self
            .inner
            .observers
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        observers.retain(|observer| observer.strong_count() > 0);
        observers.iter().filter_map(Weak::upgrade).collect()
    }

    pub(crate) fn notify_invalidated(&self, keys: &[ComputationKey]) {
        if keys.is_empty() {
            return;
        }
        for observer in self.observers() {
            for key in keys {
                observer.on_invalidated(key);
            }
        }
    }

    fn notify_evicted(&self, key: &ComputationKey) {
        for observer in self.observers() {
            observer.on_evicted(key);
        }
    }
}

impl std::fmt::Debug for ComputeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeCache")
            .field("entries", &self.inner.entries.len())
            .field("operations", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

async fn wait_for_outcome(
    key: &ComputationKey,
    mut receiver: watch::Receiver<Option<Outcome>>,
) -> Outcome {
    let aborted = || ComputeError::ProductionAborted {
        key: key.encoded().to_string(),
    };
    match receiver.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or_else(|| Err(aborted())),
        Err(_) => Err(aborted()),
    }
}

/// Clears the in-flight marker if a production task is dropped before it
/// reports, e.g. when the runtime shuts down.
struct ProductionGuard {
    cache: ComputeCache,
    key: ComputationKey,
    id: u64,
    armed: bool,
}

impl Drop for ProductionGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!(key = %self.key, "Production task dropped before completion");
            self.cache.abandon(&self.key, self.id);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
