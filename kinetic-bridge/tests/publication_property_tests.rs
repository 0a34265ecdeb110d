//! Property-Based Tests for Publication Delivery
//!
//! **Property 1: Monotonic Delivery**
//!
//! For any sequence of invalidations of a subscribed key, each channel SHALL
//! receive strictly increasing versions, ending with the latest one.
//!
//! **Property 2: Channel Isolation**
//!
//! Unsubscribing or losing one channel SHALL NOT affect delivery to the
//! other channels of the same publication.

use kinetic_bridge::{BridgeConfig, PublicationState, Publisher};
use kinetic_core::{BridgeError, ComputationKey, ComputeError, Version};
use kinetic_test_utils::{assertions, fixtures, RecordingChannel};
use proptest::prelude::*;
use proptest::test_runner::TestCaseError;
use std::time::Duration;

// ============================================================================
// TEST CONFIGURATION
// ============================================================================

const WAIT: Duration = Duration::from_secs(2);

fn publisher() -> (Publisher, fixtures::SampleProducers) {
    let (cache, producers) = fixtures::sample_cache();
    (Publisher::new(cache, BridgeConfig::default()), producers)
}

fn runtime() -> Result<tokio::runtime::Runtime, TestCaseError> {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .map_err(|e| TestCaseError::fail(format!("Failed to create runtime: {}", e)))
}

// ============================================================================
// PROPERTY TESTS
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(20))]

    /// **Property 1: Monotonic Delivery**
    #[test]
    fn prop_delivery_is_monotonic(
        invalidations in 1usize..40,
        delay_ms in 0u64..3,
        pause_every in 1usize..10,
    ) {
        let rt = runtime()?;
        rt.block_on(async {
            let (publisher, producers) = publisher();
            let key = fixtures::ticker_key();
            let fast = RecordingChannel::new();
            let slow = RecordingChannel::with_delay(Duration::from_millis(delay_ms));

            publisher
                .subscribe(key.clone(), fast.clone())
                .await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;
            publisher
                .subscribe(key.clone(), slow.clone())
                .await
                .map_err(|e| TestCaseError::fail(e.to_string()))?;

            for i in 0..invalidations {
                publisher.cache().invalidate(&key);
                if i % pause_every == 0 {
                    tokio::task::yield_now().await;
                }
            }

            // Once the pump settles, the final version is one more than the
            // number of recomputations it ran.
            let expected = wait_for_quiet(&publisher, &key).await;
            prop_assert!(fast.wait_for_version(expected.get(), WAIT).await);
            prop_assert!(slow.wait_for_version(expected.get(), WAIT).await);

            for channel in [&fast, &slow] {
                let versions = channel.versions();
                prop_assert_eq!(versions.first().copied(), Some(1));
                prop_assert_eq!(versions.last().copied(), Some(expected.get()));
                prop_assert!(versions.windows(2).all(|w| w[0] < w[1]), "{:?}", versions);
            }
            prop_assert_eq!(producers.ticker.calls() as u64, expected.get());
            Ok::<(), TestCaseError>(())
        })?;
    }
}

/// Wait until no production is running for `key` and return the
/// publication's version.
async fn wait_for_quiet(publisher: &Publisher, key: &ComputationKey) -> Version {
    let mut last = Version::ZERO;
    let mut stable_rounds = 0;
    while stable_rounds < 5 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        let in_flight = publisher
            .cache()
            .entry(key)
            .map(|entry| entry.in_flight)
            .unwrap_or(false);
        let version = publisher
            .publication(key)
            .map(|p| p.version())
            .unwrap_or(Version::ZERO);
        if !in_flight && version == last {
            stable_rounds += 1;
        } else {
            stable_rounds = 0;
            last = version;
        }
    }
    last
}

// ============================================================================
// SCENARIOS
// ============================================================================

/// **Property 2: Channel Isolation**
#[tokio::test]
async fn test_unsubscribe_one_channel_keeps_others() {
    let (publisher, _) = publisher();
    let key = fixtures::ticker_key();
    let stays = RecordingChannel::new();
    let leaves = RecordingChannel::new();

    publisher.subscribe(key.clone(), stays.clone()).await.unwrap();
    publisher.subscribe(key.clone(), leaves.clone()).await.unwrap();

    publisher.cache().invalidate(&key);
    assert!(stays.wait_for_version(2, WAIT).await);
    assert!(leaves.wait_for_version(2, WAIT).await);

    assert!(publisher.unsubscribe(leaves.id()));
    publisher.cache().invalidate(&key);
    assert!(stays.wait_for_version(3, WAIT).await);

    assert_eq!(stays.versions(), vec![1, 2, 3]);
    assert_eq!(leaves.versions(), vec![1, 2]);
    let publication = publisher.publication(&key).unwrap();
    assert_eq!(publication.state(), PublicationState::Active);
    assert_eq!(publication.subscriber_count(), 1);
}

/// **Property 2: Channel Isolation**
#[tokio::test]
async fn test_unsubscribe_mid_delivery_keeps_others() {
    let (publisher, _) = publisher();
    let key = fixtures::ticker_key();
    let stays = RecordingChannel::new();
    let leaves = RecordingChannel::with_delay(Duration::from_millis(50));

    publisher.subscribe(key.clone(), stays.clone()).await.unwrap();
    publisher.subscribe(key.clone(), leaves.clone()).await.unwrap();

    publisher.cache().invalidate(&key);
    assert!(stays.wait_for_version(2, WAIT).await);
    // `leaves` is still inside its delivery of version 2.
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(publisher.unsubscribe(leaves.id()));

    for version in 3..=5 {
        publisher.cache().invalidate(&key);
        assert!(stays.wait_for_version(version, WAIT).await);
    }
    tokio::time::sleep(Duration::from_millis(80)).await;

    assert_eq!(stays.versions(), vec![1, 2, 3, 4, 5]);
    assert_eq!(leaves.versions(), vec![1]);
    assert_eq!(publisher.publication(&key).unwrap().subscriber_count(), 1);
}

#[tokio::test]
async fn test_invalidation_during_initial_delivery_is_pushed() {
    let (publisher, producers) = publisher();
    let key = fixtures::ticker_key();
    let channel = RecordingChannel::with_delay(Duration::from_millis(50));

    let subscribing = tokio::spawn({
        let (publisher, key, channel) = (publisher.clone(), key.clone(), channel.clone());
        async move { publisher.subscribe(key, channel).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    publisher.cache().invalidate(&key);
    subscribing.await.unwrap().unwrap();

    assert!(channel.wait_for_version(2, WAIT).await);
    assert_eq!(channel.versions(), vec![1, 2]);
    assert_eq!(producers.ticker.calls(), 2);
    assert!(publisher.cache().entry(&key).unwrap().validity.is_valid());
}

#[tokio::test]
async fn test_closed_channel_is_unsubscribed() {
    let (publisher, _) = publisher();
    let key = fixtures::ticker_key();
    let healthy = RecordingChannel::new();
    let broken = RecordingChannel::new();

    publisher.subscribe(key.clone(), healthy.clone()).await.unwrap();
    publisher.subscribe(key.clone(), broken.clone()).await.unwrap();
    broken.close();

    publisher.cache().invalidate(&key);
    assert!(healthy.wait_for_version(2, WAIT).await);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(publisher.channel_key(broken.id()).is_none());
    assert!(publisher.channel_key(healthy.id()).is_some());
    assert_eq!(publisher.stats().deliveries_failed, 1);
    assert_eq!(broken.versions(), vec![1]);
}

#[tokio::test]
async fn test_time_like_ticker_coalesces() {
    let (publisher, _) = publisher();
    let key = fixtures::ticker_key();
    let channel = RecordingChannel::with_delay(Duration::from_millis(5));
    publisher.subscribe(key.clone(), channel.clone()).await.unwrap();

    for _ in 0..50 {
        publisher.cache().invalidate(&key);
    }
    let latest = wait_for_quiet(&publisher, &key).await;
    assert!(channel.wait_for_version(latest.get(), WAIT).await);

    let versions = channel.versions();
    assertions::assert_strictly_increasing(&versions);
    // Bursts collapse: far fewer pushes than invalidations.
    assert!(versions.len() < 50, "{versions:?}");
}

#[tokio::test]
async fn test_zero_keep_alive_subscription_is_retained() {
    let (publisher, producers) = publisher();
    let key = ComputationKey::new("scratch", vec![]);
    let channel = RecordingChannel::new();

    publisher.subscribe(key.clone(), channel.clone()).await.unwrap();
    assert!(publisher.cache().contains(&key));
    assert!(publisher.cache().sweep().evicted.is_empty());

    publisher.unsubscribe(channel.id());
    assert!(!publisher.cache().contains(&key));
    assert_eq!(producers.scratch.calls(), 1);
}

#[tokio::test]
async fn test_session_scoped_subscription() {
    let (publisher, _) = publisher();
    let key = publisher
        .cache()
        .registry()
        .key_for("greeting", vec![], Some("alice".into()))
        .unwrap();
    let channel = RecordingChannel::new();

    let subscription = publisher.subscribe(key, channel.clone()).await.unwrap();
    assert_eq!(
        subscription.initial.value(),
        Some(&serde_json::json!("hello alice"))
    );
}

#[tokio::test]
async fn test_unknown_operation_subscribe_fails() {
    let (publisher, _) = publisher();
    let key = ComputationKey::new("missing", vec![]);
    let err = publisher
        .subscribe(key.clone(), RecordingChannel::new())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Compute(ComputeError::UnknownOperation { .. })
    ));
    assert!(publisher.channel_key(kinetic_core::ChannelId::new()).is_none());
}
