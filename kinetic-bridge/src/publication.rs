//! A publication: the pushed view of one cached key.
//!
//! ```text
//!            attach            detach (last channel)
//! Passive ───────────► Active ─────────────────────► Passive
//!    │                   │
//!    └──── close ────────┴──── close ──────────────► Removed
//! ```
//!
//! `Removed` is final; a later subscribe creates a new publication with a new
//! id. The latest result is held in a `watch` channel, so every subscriber's
//! forwarder only ever sees the newest value and skips intermediate ones.

use kinetic_core::{CachedResult, ChannelId, ComputationKey, PublicationId, Timestamp, Version};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PublicationState {
    /// At least one channel is subscribed; invalidations trigger a push.
    Active,
    /// No channels; the entry is subject to keep-alive like any other.
    Passive,
    /// Closed for good.
    Removed,
}

struct Slots {
    state: PublicationState,
    subscribers: HashMap<ChannelId, JoinHandle<()>>,
    pump: Option<JoinHandle<()>>,
}

pub struct Publication {
    id: PublicationId,
    key: ComputationKey,
    created_at: Timestamp,
    slots: Mutex<Slots>,
    latest: watch::Sender<Option<Arc<CachedResult>>>,
    /// Subscribes in progress that have not attached their channel yet.
    pending: AtomicUsize,
    pub(crate) refresh: Notify,
}

impl Publication {
    pub(crate) fn new(key: ComputationKey) -> Arc<Self> {
        let (latest, _) = watch::channel(None);
        Arc::new(Self {
            id: PublicationId::new(),
            key,
            created_at: chrono::Utc::now(),
            slots: Mutex::new(Slots {
                state: PublicationState::Passive,
                subscribers: HashMap::new(),
                pump: None,
            }),
            latest,
            pending: AtomicUsize::new(0),
            refresh: Notify::new(),
        })
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> PublicationId {
        self.id
    }

    pub fn key(&self) -> &ComputationKey {
        &self.key
    }

    pub fn created_at(&self) -> Timestamp {
        self.created_at
    }

    pub fn state(&self) -> PublicationState {
        self.slots().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == PublicationState::Active
    }

    pub fn subscriber_count(&self) -> usize {
        self.slots().subscribers.len()
    }

    /// The newest result offered to this publication.
    pub fn latest(&self) -> Option<Arc<CachedResult>> {
        self.latest.borrow().clone()
    }

    pub fn version(&self) -> Version {
        self.latest
            .borrow()
            .as_ref()
            .map(|r| r.version())
            .unwrap_or(Version::ZERO)
    }

    /// True while the underlying entry must not be evicted.
    pub(crate) fn retains(&self) -> bool {
        self.pending.load(Ordering::SeqCst) > 0 || self.is_active()
    }

    /// Nobody uses this publication and nobody is about to.
    pub(crate) fn is_idle(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.subscriber_count() == 0
    }

    /// Publish `result` if it is newer than the latest one.
    pub(crate) fn offer(&self, result: Arc<CachedResult>) -> bool {
        self.latest.send_if_modified(|latest| match latest {
            Some(current) if current.version() >= result.version() => false,
            _ => {
                *latest = Some(result);
                true
            }
        })
    }

    /// Forget the latest result after its entry was evicted; a fresh entry
    /// numbers its versions from 1 again.
    pub(crate) fn reset(&self) {
        self.latest.send_replace(None);
    }

    pub(crate) fn watch(&self) -> watch::Receiver<Option<Arc<CachedResult>>> {
        self.latest.subscribe()
    }

    pub(crate) fn reserve(&self) {
        self.pending.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn unreserve(&self) {
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn set_pump(&self, pump: JoinHandle<()>) {
        let mut slots = self.slots();
        if slots.state == PublicationState::Removed {
            pump.abort();
        } else if let Some(previous) = slots.pump.replace(pump) {
            previous.abort();
        }
    }

    /// Register a channel's forwarder. On a removed publication the forwarder
    /// is handed back to the caller.
    pub(crate) fn attach(
        &self,
        channel: ChannelId,
        forwarder: JoinHandle<()>,
    ) -> Result<(), JoinHandle<()>> {
        let mut slots = self.slots();
        if slots.state == PublicationState::Removed {
            return Err(forwarder);
        }
        if let Some(previous) = slots.subscribers.insert(channel, forwarder) {
            previous.abort();
        }
        slots.state = PublicationState::Active;
        Ok(())
    }

    /// Remove a channel. Returns true when this made the publication passive.
    pub(crate) fn detach(&self, channel: ChannelId) -> bool {
        let mut slots = self.slots();
        let Some(forwarder) = slots.subscribers.remove(&channel) else {
            return false;
        };
        forwarder.abort();
        if slots.subscribers.is_empty() && slots.state == PublicationState::Active {
            slots.state = PublicationState::Passive;
            return true;
        }
        false
    }

    /// Move to `Removed`, stopping every task. Returns the channels that were
    /// still attached.
    pub(crate) fn close(&self) -> Vec<ChannelId> {
        let mut slots = self.slots();
        slots.state = PublicationState::Removed;
        if let Some(pump) = slots.pump.take() {
            pump.abort();
        }
        let channels: Vec<ChannelId> = slots.subscribers.keys().copied().collect();
        for (_, forwarder) in slots.subscribers.drain() {
            forwarder.abort();
        }
        drop(slots);
        self.refresh.notify_one();
        channels
    }
}

impl std::fmt::Debug for Publication {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publication")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("version", &self.version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(version: u64) -> Arc<CachedResult> {
        Arc::new(CachedResult::new(
            ComputationKey::new("time", vec![]),
            Version::new(version),
            Ok(json!(version)),
            vec![],
        ))
    }

    #[test]
    fn test_offer_only_accepts_newer() {
        let publication = Publication::new(ComputationKey::new("time", vec![]));
        assert!(publication.offer(result(2)));
        assert!(!publication.offer(result(1)));
        assert!(!publication.offer(result(2)));
        assert!(publication.offer(result(3)));
        assert_eq!(publication.version(), Version::new(3));

        publication.reset();
        assert_eq!(publication.version(), Version::ZERO);
        assert!(publication.offer(result(1)));
    }

    #[tokio::test]
    async fn test_state_machine() {
        let publication = Publication::new(ComputationKey::new("time", vec![]));
        assert_eq!(publication.state(), PublicationState::Passive);
        assert!(publication.is_idle());

        let channel = ChannelId::new();
        publication
            .attach(channel, tokio::spawn(async {}))
            .expect("attach to live publication");
        assert_eq!(publication.state(), PublicationState::Active);
        assert!(publication.retains());

        assert!(publication.detach(channel));
        assert_eq!(publication.state(), PublicationState::Passive);
        assert!(!publication.detach(channel));

        publication.close();
        assert_eq!(publication.state(), PublicationState::Removed);
        assert!(publication.attach(ChannelId::new(), tokio::spawn(async {})).is_err());
        assert_eq!(publication.state(), PublicationState::Removed);
    }

    #[test]
    fn test_pending_reservation_retains() {
        let publication = Publication::new(ComputationKey::new("time", vec![]));
        assert!(!publication.retains());
        publication.reserve();
        assert!(publication.retains());
        assert!(!publication.is_idle());
        publication.unreserve();
        assert!(publication.is_idle());
    }
}
