//! KINETIC Test Utilities
//!
//! Centralized test infrastructure for the KINETIC workspace:
//! - Recording channels for observing pushed updates
//! - Counting producers for asserting how often work ran
//! - Test fixtures for common registries
//! - Proptest generators for keys and arguments
//! - Custom assertions for KINETIC-specific validation

pub use kinetic_bridge::{Channel, ChannelClosed, Publisher};
pub use kinetic_compute::{
    producer_fn, ComputeCache, ComputeContext, OperationDescriptor, OperationRegistry, Producer,
};
pub use kinetic_core::{
    CachedResult, ChannelId, ComputationKey, ComputeError, ComputeResult, KeepAlive,
    ProductionFailure, PublicationUpdate, Session, Version,
};

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

// ============================================================================
// MOCK CHANNELS
// ============================================================================

/// Channel that records every delivered update.
#[derive(Debug)]
pub struct RecordingChannel {
    id: ChannelId,
    updates: Mutex<Vec<PublicationUpdate>>,
    closed: AtomicBool,
    delay: Duration,
    delivered: Notify,
}

impl RecordingChannel {
    pub fn new() -> Arc<Self> {
        Self::with_delay(Duration::ZERO)
    }

    /// A channel that takes `delay` to accept each update, like a slow
    /// network peer.
    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            id: ChannelId::new(),
            updates: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            delay,
            delivered: Notify::new(),
        })
    }

    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Make every further delivery fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn updates(&self) -> Vec<PublicationUpdate> {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn versions(&self) -> Vec<u64> {
        self.updates().iter().map(|u| u.version.get()).collect()
    }

    pub fn last(&self) -> Option<PublicationUpdate> {
        self.updates().last().cloned()
    }

    /// Wait until an update with at least `version` arrived.
    ///
    /// Returns false on timeout.
    pub async fn wait_for_version(&self, version: u64, timeout: Duration) -> bool {
        let reached = async {
            loop {
                let notified = self.delivered.notified();
                if self.versions().iter().any(|v| *v >= version) {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, reached).await.is_ok()
    }
}

#[async_trait]
impl Channel for RecordingChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn deliver(&self, update: PublicationUpdate) -> Result<(), ChannelClosed> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ChannelClosed);
        }
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(update);
        self.delivered.notify_waiters();
        Ok(())
    }
}

// ============================================================================
// COUNTING PRODUCERS
// ============================================================================

/// Producer that counts its invocations and computes its value with a plain
/// function of the arguments.
pub struct CountingProducer {
    calls: AtomicUsize,
    compute: Box<dyn Fn(&[Value]) -> ComputeResult<Value> + Send + Sync>,
}

impl CountingProducer {
    pub fn new(
        compute: impl Fn(&[Value]) -> ComputeResult<Value> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            compute: Box::new(compute),
        })
    }

    /// Always produces `value`.
    pub fn constant(value: Value) -> Arc<Self> {
        Self::new(move |_| Ok(value.clone()))
    }

    /// Produces the sum of its integer arguments.
    pub fn sum() -> Arc<Self> {
        Self::new(|args| Ok(Value::from(args.iter().filter_map(Value::as_i64).sum::<i64>())))
    }

    /// Produces how many times it has been called, starting at 1.
    pub fn ticker() -> Arc<Self> {
        Self::new(|_| Ok(Value::Null))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Producer for CountingProducer {
    async fn produce(&self, _ctx: ComputeContext, args: Vec<Value>) -> ComputeResult<Value> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match (self.compute)(&args)? {
            Value::Null => Ok(Value::from(call)),
            value => Ok(value),
        }
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built registries and caches for common testing scenarios.

    use super::*;

    /// Producers of the sample registry, for call counting.
    pub struct SampleProducers {
        pub sum: Arc<CountingProducer>,
        pub ticker: Arc<CountingProducer>,
        pub scratch: Arc<CountingProducer>,
    }

    /// Registry with:
    /// - `sum(a, b, ...)`: keep-alive 1s
    /// - `ticker()`: call counter, keep-alive 60s
    /// - `scratch()`: constant, no keep-alive
    /// - `doubled(a, b)`: `2 * sum(a, b)` via a nested call, keep-alive 1s
    /// - `greeting()`: session-scoped, `"hello <session>"`
    pub fn sample_registry() -> (OperationRegistry, SampleProducers) {
        let producers = SampleProducers {
            sum: CountingProducer::sum(),
            ticker: CountingProducer::ticker(),
            scratch: CountingProducer::constant(Value::from("scratch")),
        };

        let registry = OperationRegistry::builder()
            .operation("sum", KeepAlive::from_secs(1), producers.sum.clone())
            .operation("ticker", KeepAlive::from_secs(60), producers.ticker.clone())
            .operation("scratch", KeepAlive::NONE, producers.scratch.clone())
            .operation(
                "doubled",
                KeepAlive::from_secs(1),
                producer_fn(|ctx, args| async move {
                    let sum = ctx.call("sum", args).await?;
                    Ok(Value::from(sum.as_i64().unwrap_or(0) * 2))
                }),
            )
            .register(
                OperationDescriptor::new(
                    "greeting",
                    producer_fn(|ctx, _args| async move {
                        let who = ctx.session().map(|s| s.as_str().to_string());
                        Ok(Value::from(format!(
                            "hello {}",
                            who.as_deref().unwrap_or("anonymous")
                        )))
                    }),
                )
                .with_keep_alive(KeepAlive::from_secs(1))
                .session_scoped(),
            )
            .build()
            .unwrap_or_else(|e| panic!("sample registry is valid: {e}"));

        (registry, producers)
    }

    /// Cache over [`sample_registry`].
    pub fn sample_cache() -> (ComputeCache, SampleProducers) {
        let (registry, producers) = sample_registry();
        (ComputeCache::new(registry), producers)
    }

    pub fn sum_key(a: i64, b: i64) -> ComputationKey {
        ComputationKey::new("sum", vec![Value::from(a), Value::from(b)])
    }

    pub fn ticker_key() -> ComputationKey {
        ComputationKey::new("ticker", vec![])
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for keys and arguments.

    use super::*;
    use proptest::prelude::*;

    /// Valid operation names.
    pub fn arb_operation_name() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_.]{0,15}"
    }

    /// JSON scalars and small nested values usable as arguments.
    pub fn arb_arg() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::from),
            any::<i64>().prop_map(Value::from),
            "[ -~]{0,12}".prop_map(Value::from),
        ];
        leaf.prop_recursive(2, 8, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    pub fn arb_args() -> impl Strategy<Value = Vec<Value>> {
        prop::collection::vec(arb_arg(), 0..5)
    }

    pub fn arb_session() -> impl Strategy<Value = Session> {
        "[A-Za-z0-9-]{1,24}".prop_map(Session::new)
    }

    pub fn arb_key() -> impl Strategy<Value = ComputationKey> {
        (arb_operation_name(), arb_args(), proptest::option::of(arb_session())).prop_map(
            |(operation, args, session)| match session {
                Some(session) => ComputationKey::with_session(operation, args, session),
                None => ComputationKey::new(operation, args),
            },
        )
    }

    pub fn arb_keep_alive() -> impl Strategy<Value = KeepAlive> {
        prop_oneof![Just(KeepAlive::NONE), (1u64..3600).prop_map(KeepAlive::from_secs)]
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Custom assertion functions for KINETIC-specific validation.

    use super::*;

    /// Assert that versions never go backwards or repeat.
    #[track_caller]
    pub fn assert_strictly_increasing(versions: &[u64]) {
        for pair in versions.windows(2) {
            assert!(
                pair[0] < pair[1],
                "Versions not strictly increasing: {:?}",
                versions
            );
        }
    }

    /// Assert that a result is a cyclic dependency rejection.
    #[track_caller]
    pub fn assert_cyclic<T: std::fmt::Debug>(result: &ComputeResult<T>) {
        match result {
            Err(ComputeError::CyclicDependency { .. }) => {}
            other => panic!("Expected CyclicDependency, got: {:?}", other),
        }
    }

    /// Assert that a cached result carries a failure with `message`.
    #[track_caller]
    pub fn assert_failure(result: &CachedResult, message: &str) {
        match result.failure() {
            Some(failure) => assert_eq!(failure.message, message),
            None => panic!("Expected failure {:?}, got value {:?}", message, result.value()),
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
