//! The handle a producer uses to make nested cached calls.

use kinetic_core::{
    CachedResult, ComputationKey, ComputeError, ComputeResult, ProductionFailure, Session,
};
use serde_json::Value;
use std::sync::{Arc, Mutex, PoisonError};

use crate::cache::ComputeCache;

/// One running production: its key, the chain of productions that led to it
/// and the dependencies read so far.
#[derive(Debug)]
pub(crate) struct Frame {
    key: ComputationKey,
    chain: Vec<ComputationKey>,
    dependencies: Mutex<Vec<ComputationKey>>,
}

impl Frame {
    pub(crate) fn new(parent: Option<&Frame>, key: ComputationKey) -> Self {
        let mut chain = parent.map(|p| p.chain.clone()).unwrap_or_default();
        chain.push(key.clone());
        Self {
            key,
            chain,
            dependencies: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn key(&self) -> &ComputationKey {
        &self.key
    }

    pub(crate) fn chain(&self) -> &[ComputationKey] {
        &self.chain
    }

    /// Encoded chain ending in `next`, for cycle reports.
    pub(crate) fn chain_to(&self, next: &ComputationKey) -> Vec<String> {
        self.chain
            .iter()
            .chain(std::iter::once(next))
            .map(|k| k.encoded().to_string())
            .collect()
    }

    pub(crate) fn record(&self, dependency: &ComputationKey) {
        let mut dependencies = self
            .dependencies
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !dependencies.contains(dependency) {
            dependencies.push(dependency.clone());
        }
    }

    pub(crate) fn take_dependencies(&self) -> Vec<ComputationKey> {
        std::mem::take(
            &mut *self
                .dependencies
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }
}

/// Passed to every producer invocation.
///
/// Calls made through the context are served from the cache and recorded as
/// dependencies of the running production, so invalidating any of them
/// invalidates this result too.
#[derive(Clone)]
pub struct ComputeContext {
    cache: ComputeCache,
    frame: Arc<Frame>,
}

impl ComputeContext {
    pub(crate) fn new(cache: ComputeCache, frame: Arc<Frame>) -> Self {
        Self { cache, frame }
    }

    /// Key of the production this context belongs to.
    pub fn key(&self) -> &ComputationKey {
        self.frame.key()
    }

    /// Session of the current call, if the operation is session-scoped.
    pub fn session(&self) -> Option<&Session> {
        self.frame.key().session()
    }

    /// Call another operation with the current session.
    pub async fn call(&self, operation: &str, args: Vec<Value>) -> ComputeResult<Value> {
        self.call_with_session(operation, args, self.session().cloned())
            .await
    }

    /// Call another operation with an explicit session.
    pub async fn call_with_session(
        &self,
        operation: &str,
        args: Vec<Value>,
        session: Option<Session>,
    ) -> ComputeResult<Value> {
        let key = self.cache.registry().key_for(operation, args, session)?;
        let result = self.get(&key).await?;
        match result.output() {
            Ok(value) => Ok(value.clone()),
            Err(failure) => Err(ComputeError::Production(attribute(&key, failure))),
        }
    }

    /// Resolve a key as a dependency and return the full cached result.
    pub async fn get(&self, key: &ComputationKey) -> ComputeResult<Arc<CachedResult>> {
        self.cache.resolve(key, Some(&self.frame)).await
    }
}

/// Keep the innermost origin of a nested failure.
fn attribute(key: &ComputationKey, failure: &ProductionFailure) -> ProductionFailure {
    match failure.source_key {
        Some(_) => failure.clone(),
        None => ProductionFailure::from_dependency(key, failure.message.clone()),
    }
}
