//! Hooks through which other components follow the cache's lifecycle.

use kinetic_core::ComputationKey;

/// Receives cache lifecycle notifications.
///
/// Callbacks run synchronously on the invalidating/evicting task after the
/// cache has released its entry locks, so they must not block. `retains` is
/// consulted while an eviction candidate is locked and must only read the
/// observer's own state.
pub trait CacheObserver: Send + Sync {
    /// An entry was marked invalidated (or a production finished already stale).
    fn on_invalidated(&self, _key: &ComputationKey) {}

    /// An entry was removed from the cache.
    fn on_evicted(&self, _key: &ComputationKey) {}

    /// Return true to keep `key` from being evicted.
    fn retains(&self, _key: &ComputationKey) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Silent;

    impl CacheObserver for Silent {}

    #[test]
    fn test_default_hooks_retain_nothing() {
        let key = ComputationKey::new("sum", vec![]);
        let observer = Silent;
        observer.on_invalidated(&key);
        observer.on_evicted(&key);
        assert!(!observer.retains(&key));
    }
}
