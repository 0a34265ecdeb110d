//! The publisher: binds channels to publications and keeps active
//! publications fresh.
//!
//! The publisher observes the compute cache. When a key with an active
//! publication is invalidated, the publication's pump recomputes it and
//! offers the new result; one forwarder task per channel then delivers the
//! newest result the channel has not seen yet.

use dashmap::DashMap;
use kinetic_compute::{CacheObserver, ComputeCache};
use kinetic_core::{
    BridgeError, BridgeResult, CachedResult, ChannelId, ComputationKey, PublicationId,
    PublicationUpdate, PublisherId, Version,
};
use std::sync::{Arc, Weak};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::channel::{Channel, ChannelClosed};
use crate::config::BridgeConfig;
use crate::publication::{Publication, PublicationState};
use crate::stats::{PublisherStats, PublisherStatsSnapshot};

/// Attempts made when a publication is removed while a subscribe is
/// attaching to it.
const SUBSCRIBE_ATTEMPTS: usize = 3;

/// Result of a successful subscribe.
#[derive(Debug, Clone)]
pub struct Subscription {
    pub publication_id: PublicationId,
    pub channel: ChannelId,
    pub key: ComputationKey,
    /// The value delivered to the channel on subscribe.
    pub initial: PublicationUpdate,
}

/// Shared handle to the publisher. Clones refer to the same publisher.
#[derive(Clone)]
pub struct Publisher {
    inner: Arc<PublisherInner>,
}

struct PublisherInner {
    id: PublisherId,
    cache: ComputeCache,
    publications: DashMap<ComputationKey, Arc<Publication>>,
    channels: DashMap<ChannelId, ComputationKey>,
    stats: Arc<PublisherStats>,
}

/// Holds a publication's pending count up while a subscribe runs.
struct Reservation(Arc<Publication>);

impl Drop for Reservation {
    fn drop(&mut self) {
        self.0.unreserve();
    }
}

impl Publisher {
    /// Create a publisher and register it with `cache`.
    pub fn new(cache: ComputeCache, config: BridgeConfig) -> Self {
        let inner = Arc::new(PublisherInner {
            id: config.publisher_id,
            cache,
            publications: DashMap::new(),
            channels: DashMap::new(),
            stats: Arc::new(PublisherStats::default()),
        });
        let weak: Weak<PublisherInner> = Arc::downgrade(&inner);
        let observer: Weak<dyn CacheObserver> = weak;
        inner.cache.add_observer(observer);
        info!(publisher_id = %inner.id, "Publisher started");
        Self { inner }
    }

    pub fn id(&self) -> PublisherId {
        self.inner.id
    }

    pub fn cache(&self) -> &ComputeCache {
        &self.inner.cache
    }

    /// Subscribe `channel` to `key`.
    ///
    /// The current value (computed if stale) is delivered to the channel
    /// before this returns; later versions follow as the key is invalidated.
    /// Subscribing a channel id that is already subscribed replaces the old
    /// subscription and delivers the current value again.
    pub async fn subscribe(
        &self,
        key: ComputationKey,
        channel: Arc<dyn Channel>,
    ) -> BridgeResult<Subscription> {
        let mut attempt = 1;
        loop {
            match self.try_subscribe(&key, Arc::clone(&channel)).await {
                Err(BridgeError::PublicationRemoved { .. }) if attempt < SUBSCRIBE_ATTEMPTS => {
                    debug!(key = %key, attempt, "Publication removed during subscribe, retrying");
                    attempt += 1;
                }
                outcome => return outcome,
            }
        }
    }

    async fn try_subscribe(
        &self,
        key: &ComputationKey,
        channel: Arc<dyn Channel>,
    ) -> BridgeResult<Subscription> {
        let channel_id = channel.id();
        let publication = self.inner.acquire(key);
        let reservation = Reservation(Arc::clone(&publication));

        let result = match self.inner.cache.get_or_compute(key).await {
            Ok(result) => result,
            Err(err) => {
                drop(reservation);
                self.inner.cache.release(key);
                return Err(err.into());
            }
        };
        publication.offer(result);

        let mut latest = publication.watch();
        let current = latest.borrow_and_update().clone();
        let Some(current) = current else {
            // Reset by an eviction between compute and watch.
            drop(reservation);
            return Err(BridgeError::PublicationRemoved {
                key: key.encoded().to_string(),
            });
        };
        let initial = PublicationUpdate::from(&current);

        if channel.deliver(initial.clone()).await.is_err() {
            drop(reservation);
            self.inner.cache.release(key);
            return Err(BridgeError::SubscriptionClosed {
                channel: channel_id,
            });
        }

        let forwarder = tokio::spawn(forward(
            channel,
            latest,
            current.version(),
            Arc::downgrade(&self.inner),
            Arc::clone(&self.inner.stats),
        ));
        if let Err(forwarder) = publication.attach(channel_id, forwarder) {
            forwarder.abort();
            return Err(BridgeError::PublicationRemoved {
                key: key.encoded().to_string(),
            });
        }

        // An invalidation between compute and attach saw a passive
        // publication and did not wake the pump.
        if self.inner.cache.entry(key).is_some_and(|entry| {
            !entry.validity.is_valid() || entry.version() > publication.version()
        }) {
            publication.refresh.notify_one();
        }

        if let Some(previous) = self.inner.channels.insert(channel_id, key.clone()) {
            if &previous != key {
                self.inner.detach(&previous, channel_id);
            }
        }
        drop(reservation);

        PublisherStats::bump(&self.inner.stats.subscriptions_opened);
        debug!(
            key = %key,
            channel = %channel_id,
            version = %initial.version,
            "Subscribed channel"
        );

        Ok(Subscription {
            publication_id: publication.id(),
            channel: channel_id,
            key: key.clone(),
            initial,
        })
    }

    /// Remove one channel. Other channels of the same publication keep
    /// receiving updates. Returns false for an unknown channel.
    pub fn unsubscribe(&self, channel: ChannelId) -> bool {
        self.inner.unsubscribe(channel)
    }

    /// Remove the publication for `key` and drop all of its channels.
    pub fn close(&self, key: &ComputationKey) -> bool {
        self.inner.close(key)
    }

    pub fn publication(&self, key: &ComputationKey) -> Option<Arc<Publication>> {
        self.inner
            .publications
            .get(key)
            .map(|publication| Arc::clone(publication.value()))
    }

    /// Key a channel is subscribed to.
    pub fn channel_key(&self, channel: ChannelId) -> Option<ComputationKey> {
        self.inner.channels.get(&channel).map(|key| key.value().clone())
    }

    pub fn stats(&self) -> PublisherStatsSnapshot {
        self.inner
            .stats
            .snapshot(self.inner.publications.len(), self.inner.channels.len())
    }
}

impl std::fmt::Debug for Publisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher")
            .field("id", &self.inner.id)
            .field("publications", &self.inner.publications.len())
            .field("channels", &self.inner.channels.len())
            .finish()
    }
}

impl PublisherInner {
    /// Get or create the live publication for `key` and reserve it.
    fn acquire(&self, key: &ComputationKey) -> Arc<Publication> {
        let mut created = false;
        let publication = {
            let entry = self.publications.entry(key.clone()).or_insert_with(|| {
                created = true;
                Publication::new(key.clone())
            });
            entry.reserve();
            Arc::clone(entry.value())
        };

        if created {
            debug!(key = %key, publication = %publication.id(), "Created publication");
            publication.set_pump(tokio::spawn(pump(
                Arc::clone(&publication),
                self.cache.clone(),
                Arc::clone(&self.stats),
            )));
        }
        publication
    }

    fn unsubscribe(&self, channel: ChannelId) -> bool {
        let Some((_, key)) = self.channels.remove(&channel) else {
            return false;
        };
        self.detach(&key, channel);
        PublisherStats::bump(&self.stats.subscriptions_closed);
        debug!(key = %key, channel = %channel, "Unsubscribed channel");
        true
    }

    fn detach(&self, key: &ComputationKey, channel: ChannelId) {
        let publication = self
            .publications
            .get(key)
            .map(|publication| Arc::clone(publication.value()));
        if let Some(publication) = publication {
            if publication.detach(channel) {
                debug!(key = %key, "Publication is passive");
                // Keep-alive counts from the moment the last subscriber left.
                self.cache.touch(key);
                self.cache.release(key);
            }
        }
    }

    fn close(&self, key: &ComputationKey) -> bool {
        let Some((_, publication)) = self.publications.remove(key) else {
            return false;
        };
        let channels = publication.close();
        for channel in &channels {
            self.channels.remove(channel);
        }
        info!(
            key = %key,
            publication = %publication.id(),
            channels = channels.len(),
            "Closed publication"
        );
        self.cache.release(key);
        true
    }
}

impl CacheObserver for PublisherInner {
    fn on_invalidated(&self, key: &ComputationKey) {
        if let Some(publication) = self.publications.get(key) {
            if publication.is_active() {
                publication.refresh.notify_one();
            }
        }
    }

    fn on_evicted(&self, key: &ComputationKey) {
        let publication = self
            .publications
            .get(key)
            .map(|publication| Arc::clone(publication.value()));
        let Some(publication) = publication else {
            return;
        };
        if publication.subscriber_count() > 0 {
            return;
        }
        publication.reset();
        if let Some((_, removed)) = self
            .publications
            .remove_if(key, |_, publication| publication.is_idle())
        {
            removed.close();
            debug!(key = %key, publication = %removed.id(), "Removed passive publication");
        }
    }

    fn retains(&self, key: &ComputationKey) -> bool {
        self.publications
            .get(key)
            .is_some_and(|publication| publication.retains())
    }
}

impl Drop for PublisherInner {
    fn drop(&mut self) {
        for publication in self.publications.iter() {
            publication.close();
        }
    }
}

/// Recompute an active publication each time its key is invalidated.
///
/// `Notify` holds at most one permit, so invalidations that arrive during a
/// recomputation collapse into one more recomputation.
async fn pump(publication: Arc<Publication>, cache: ComputeCache, stats: Arc<PublisherStats>) {
    loop {
        publication.refresh.notified().await;
        if publication.state() == PublicationState::Removed {
            break;
        }
        if !publication.is_active() {
            continue;
        }

        PublisherStats::bump(&stats.refreshes);
        match cache.get_or_compute(publication.key()).await {
            Ok(result) => {
                publication.offer(result);
            }
            Err(err) => {
                warn!(key = %publication.key(), error = %err, "Failed to refresh publication");
            }
        }
    }
}

/// Deliver every newer result to one channel until it closes.
async fn forward(
    channel: Arc<dyn Channel>,
    mut latest: watch::Receiver<Option<Arc<CachedResult>>>,
    mut last_sent: Version,
    publisher: Weak<PublisherInner>,
    stats: Arc<PublisherStats>,
) {
    while latest.changed().await.is_ok() {
        let current = latest.borrow_and_update().clone();
        let Some(result) = current else {
            continue;
        };
        if result.version() <= last_sent {
            continue;
        }

        match channel.deliver(PublicationUpdate::from(&result)).await {
            Ok(()) => {
                last_sent = result.version();
                PublisherStats::bump(&stats.updates_pushed);
            }
            Err(ChannelClosed) => {
                PublisherStats::bump(&stats.deliveries_failed);
                warn!(
                    channel = %channel.id(),
                    key = %result.key(),
                    "Channel closed during delivery, unsubscribing"
                );
                if let Some(publisher) = publisher.upgrade() {
                    publisher.unsubscribe(channel.id());
                }
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use kinetic_compute::{producer_fn, OperationRegistry};
    use kinetic_core::KeepAlive;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    struct Collect {
        id: ChannelId,
        updates: Mutex<Vec<PublicationUpdate>>,
        closed: bool,
    }

    impl Collect {
        fn new(closed: bool) -> Arc<Self> {
            Arc::new(Self {
                id: ChannelId::new(),
                updates: Mutex::new(Vec::new()),
                closed,
            })
        }

        fn versions(&self) -> Vec<u64> {
            self.updates
                .lock()
                .unwrap()
                .iter()
                .map(|u| u.version.get())
                .collect()
        }
    }

    #[async_trait]
    impl Channel for Collect {
        fn id(&self) -> ChannelId {
            self.id
        }

        async fn deliver(&self, update: PublicationUpdate) -> Result<(), ChannelClosed> {
            if self.closed {
                return Err(ChannelClosed);
            }
            self.updates.lock().unwrap().push(update);
            Ok(())
        }
    }

    fn publisher(keep_alive: KeepAlive) -> Publisher {
        let registry = OperationRegistry::builder()
            .operation(
                "counter",
                keep_alive,
                producer_fn(|_ctx, _args| async { Ok(json!("tick")) }),
            )
            .build()
            .unwrap();
        Publisher::new(ComputeCache::new(registry), BridgeConfig::default())
    }

    fn key() -> ComputationKey {
        ComputationKey::new("counter", vec![])
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn test_subscribe_delivers_initial_value() {
        let publisher = publisher(KeepAlive::NONE);
        let channel = Collect::new(false);

        let subscription = publisher.subscribe(key(), channel.clone()).await.unwrap();
        assert_eq!(subscription.initial.version, Version::new(1));
        assert_eq!(channel.versions(), vec![1]);

        let publication = publisher.publication(&key()).unwrap();
        assert!(publication.is_active());
        assert_eq!(publication.id(), subscription.publication_id);
        // Retained by the active publication despite zero keep-alive.
        assert!(publisher.cache().contains(&key()));
    }

    #[tokio::test]
    async fn test_invalidation_pushes_to_active_channels() {
        let publisher = publisher(KeepAlive::from_secs(60));
        let channel = Collect::new(false);
        publisher.subscribe(key(), channel.clone()).await.unwrap();

        publisher.cache().invalidate(&key());
        settle().await;

        assert_eq!(channel.versions(), vec![1, 2]);
        assert_eq!(publisher.stats().updates_pushed, 1);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_makes_passive_and_releases() {
        let publisher = publisher(KeepAlive::NONE);
        let channel = Collect::new(false);
        publisher.subscribe(key(), channel.clone()).await.unwrap();

        assert!(publisher.unsubscribe(channel.id));
        assert!(!publisher.unsubscribe(channel.id));

        // Zero keep-alive: the entry goes, and the passive publication with it.
        assert!(!publisher.cache().contains(&key()));
        assert!(publisher.publication(&key()).is_none());
    }

    #[tokio::test]
    async fn test_passive_publication_is_not_recomputed() {
        let publisher = publisher(KeepAlive::from_secs(60));
        let channel = Collect::new(false);
        publisher.subscribe(key(), channel.clone()).await.unwrap();
        publisher.unsubscribe(channel.id);

        let publication = publisher.publication(&key()).unwrap();
        assert_eq!(publication.state(), PublicationState::Passive);

        publisher.cache().invalidate(&key());
        settle().await;
        assert_eq!(publication.version(), Version::new(1));
        assert_eq!(publisher.stats().refreshes, 0);
    }

    #[tokio::test]
    async fn test_closed_channel_fails_subscribe() {
        let publisher = publisher(KeepAlive::from_secs(60));
        let channel = Collect::new(true);

        let err = publisher.subscribe(key(), channel.clone()).await.unwrap_err();
        assert_eq!(err, BridgeError::SubscriptionClosed { channel: channel.id });
        assert!(publisher.channel_key(channel.id).is_none());
    }

    #[tokio::test]
    async fn test_close_removes_publication() {
        let publisher = publisher(KeepAlive::from_secs(60));
        let channel = Collect::new(false);
        let first = publisher.subscribe(key(), channel.clone()).await.unwrap();

        let publication = publisher.publication(&key()).unwrap();
        assert!(publisher.close(&key()));
        assert_eq!(publication.state(), PublicationState::Removed);
        assert!(publisher.channel_key(channel.id).is_none());
        assert!(!publisher.close(&key()));

        let again = publisher.subscribe(key(), Collect::new(false)).await.unwrap();
        assert_ne!(again.publication_id, first.publication_id);
    }
}
