//! Transport-agnostic connection handling.
//!
//! A connection reads client frames from any `Stream` of text messages and
//! writes server frames to any `Sink`. All outbound frames go through one
//! bounded queue drained by a single writer task, so frames from different
//! subscriptions never interleave mid-write. Each subscribed key gets its own
//! channel; the connection keeps the key -> channel map and unsubscribes all
//! of them when the inbound stream ends. Subscribes run as tasks, so a slow
//! first value never blocks the frames behind it.

use async_trait::async_trait;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use kinetic_bridge::{Channel, ChannelClosed, Publisher, Subscription};
use kinetic_core::{BridgeResult, ChannelId, ConnectionId, PublicationUpdate};
use std::collections::HashMap;
use std::fmt::Display;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::ApiError;
use crate::protocol::{session_from_token, ClientFrame, ServerFrame};
use crate::telemetry::metrics;

/// An item for the writer.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(String),
    Ping,
}

/// Per-connection options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionOptions {
    pub outbound_buffer: usize,
    /// Send `Outgoing::Ping` at this period when set.
    pub ping_interval: Option<Duration>,
}

impl ConnectionOptions {
    pub fn from_transport(config: &TransportConfig) -> Self {
        Self {
            outbound_buffer: config.outbound_buffer,
            ping_interval: Some(config.keep_alive),
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            outbound_buffer: crate::constants::DEFAULT_WS_OUTBOUND_BUFFER,
            ping_interval: None,
        }
    }
}

/// One key's delivery slot on a connection.
struct ConnectionChannel {
    id: ChannelId,
    outbound: mpsc::Sender<Outgoing>,
}

#[async_trait]
impl Channel for ConnectionChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    async fn deliver(&self, update: PublicationUpdate) -> Result<(), ChannelClosed> {
        let operation = update.key.operation().to_string();
        let frame = ServerFrame::Update(update).encode();
        self.outbound
            .send(Outgoing::Frame(frame))
            .await
            .map_err(|_| ChannelClosed)?;
        if let Some(metrics) = metrics() {
            metrics.record_push(&operation);
        }
        Ok(())
    }
}

/// A subscribe still waiting for its first value.
struct PendingSubscribe {
    /// Tells a settled task apart from a newer one for the same key.
    seq: u64,
    channel: ChannelId,
    abort: AbortHandle,
}

/// What a subscribe task hands back to the connection.
struct Settled {
    seq: u64,
    key: String,
    channel: ChannelId,
    outcome: BridgeResult<Subscription>,
}

struct Connection {
    id: ConnectionId,
    publisher: Publisher,
    outbound: mpsc::Sender<Outgoing>,
    /// Encoded key -> channel subscribed to it.
    subscriptions: HashMap<String, ChannelId>,
    /// Encoded key -> subscribe in progress.
    pending: HashMap<String, PendingSubscribe>,
    tasks: JoinSet<Settled>,
    next_seq: u64,
}

impl Connection {
    async fn send(&self, frame: ServerFrame) -> bool {
        self.outbound
            .send(Outgoing::Frame(frame.encode()))
            .await
            .is_ok()
    }

    async fn handle(&mut self, text: &str) -> bool {
        match ClientFrame::parse(text) {
            Ok(ClientFrame::Subscribe {
                operation_id,
                args,
                session_token,
            }) => {
                self.subscribe(&operation_id, args, session_token)
                    .await
            }
            Ok(ClientFrame::Unsubscribe { key }) => self.unsubscribe(key).await,
            Err(err) => {
                debug!(connection = %self.id, error = %err, "Rejected client frame");
                self.send(ServerFrame::error(&err, None)).await
            }
        }
    }

    /// Starts the subscribe in its own task so a slow first value never
    /// holds up later frames.
    async fn subscribe(
        &mut self,
        operation: &str,
        args: Vec<kinetic_core::Value>,
        session_token: Option<String>,
    ) -> bool {
        let session = session_from_token(session_token);
        let key = match self
            .publisher
            .cache()
            .registry()
            .key_for(operation, args, session)
        {
            Ok(key) => key,
            Err(err) => return self.send(ServerFrame::error(&ApiError::from(err), None)).await,
        };
        let encoded = key.encoded().to_string();

        // Re-subscribing reuses the slot, which re-sends the current value.
        let channel_id = match self.pending.remove(&encoded) {
            Some(previous) => {
                previous.abort.abort();
                previous.channel
            }
            None => self
                .subscriptions
                .get(&encoded)
                .copied()
                .unwrap_or_else(ChannelId::new),
        };
        let channel = Arc::new(ConnectionChannel {
            id: channel_id,
            outbound: self.outbound.clone(),
        });

        self.next_seq += 1;
        let seq = self.next_seq;
        let publisher = self.publisher.clone();
        let task_key = encoded.clone();
        let abort = self.tasks.spawn(async move {
            let outcome = publisher.subscribe(key, channel).await;
            Settled {
                seq,
                key: task_key,
                channel: channel_id,
                outcome,
            }
        });
        self.pending.insert(
            encoded,
            PendingSubscribe {
                seq,
                channel: channel_id,
                abort,
            },
        );
        true
    }

    /// Records a finished subscribe task.
    async fn settle(&mut self, settled: Settled) -> bool {
        let Settled {
            seq,
            key,
            channel,
            outcome,
        } = settled;

        let current = self.pending.get(&key).is_some_and(|p| p.seq == seq);
        if !current {
            // Unsubscribed or replaced while it ran.
            if outcome.is_ok() && !self.references(&key, channel) {
                self.publisher.unsubscribe(channel);
            }
            return true;
        }
        self.pending.remove(&key);

        match outcome {
            Ok(subscription) => {
                debug!(
                    connection = %self.id,
                    key = %key,
                    version = %subscription.initial.version,
                    "Client subscribed"
                );
                self.subscriptions.insert(key, channel);
                true
            }
            Err(err) => {
                // A failed re-subscribe leaves no half-attached slot behind.
                if let Some(previous) = self.subscriptions.remove(&key) {
                    self.publisher.unsubscribe(previous);
                }
                let err = ApiError::from(err);
                self.send(ServerFrame::error(&err, Some(key))).await
            }
        }
    }

    fn references(&self, key: &str, channel: ChannelId) -> bool {
        self.subscriptions.get(key) == Some(&channel)
            || self.pending.get(key).is_some_and(|p| p.channel == channel)
    }

    async fn unsubscribe(&mut self, key: String) -> bool {
        let pending = self.pending.remove(&key);
        if let Some(pending) = &pending {
            pending.abort.abort();
            // It may have attached before the abort landed.
            self.publisher.unsubscribe(pending.channel);
        }
        let subscribed = self.subscriptions.remove(&key);
        if let Some(channel) = subscribed {
            self.publisher.unsubscribe(channel);
        }

        if pending.is_none() && subscribed.is_none() {
            let err = ApiError::subscription_not_found(&key);
            return self.send(ServerFrame::error(&err, Some(key))).await;
        }
        debug!(connection = %self.id, key = %key, "Client unsubscribed");
        self.send(ServerFrame::Unsubscribed { key }).await
    }

    async fn close(&mut self) {
        for (_, pending) in self.pending.drain() {
            pending.abort.abort();
            self.publisher.unsubscribe(pending.channel);
        }
        self.tasks.abort_all();
        // A task still mid-poll when aborted can attach after the drain.
        while let Some(joined) = self.tasks.join_next().await {
            if let Ok(Settled {
                channel,
                outcome: Ok(_),
                ..
            }) = joined
            {
                self.publisher.unsubscribe(channel);
            }
        }
        for (_, channel) in self.subscriptions.drain() {
            self.publisher.unsubscribe(channel);
        }
    }
}

/// Serve one client until its inbound stream ends or the writer fails.
///
/// Sends `connected` first, then handles subscribe/unsubscribe frames in
/// order. Subscribes run concurrently; an unsubscribe cancels one still in
/// progress. On return every subscription of the connection is gone.
pub async fn serve_connection<I, O>(
    publisher: Publisher,
    inbound: I,
    outbound: O,
    options: ConnectionOptions,
) where
    I: Stream<Item = String> + Send,
    O: Sink<Outgoing> + Send + 'static,
    O::Error: Display,
{
    let (tx, rx) = mpsc::channel(options.outbound_buffer.max(1));
    let writer = tokio::spawn(write_frames(rx, outbound, options.ping_interval));

    let mut connection = Connection {
        id: ConnectionId::new(),
        publisher: publisher.clone(),
        outbound: tx,
        subscriptions: HashMap::new(),
        pending: HashMap::new(),
        tasks: JoinSet::new(),
        next_seq: 0,
    };

    info!(connection = %connection.id, "Client connected");
    if let Some(metrics) = metrics() {
        metrics.ws_connected();
    }

    let connected = ServerFrame::Connected {
        publisher_id: publisher.id(),
        connection_id: connection.id,
    };
    if connection.send(connected).await {
        futures_util::pin_mut!(inbound);
        loop {
            let open = tokio::select! {
                text = inbound.next() => match text {
                    Some(text) => connection.handle(&text).await,
                    None => break,
                },
                Some(joined) = connection.tasks.join_next() => match joined {
                    Ok(settled) => connection.settle(settled).await,
                    Err(err) => {
                        if err.is_panic() {
                            warn!(connection = %connection.id, error = %err, "Subscribe task panicked");
                        }
                        true
                    }
                },
            };
            if !open {
                debug!(connection = %connection.id, "Writer closed, dropping connection");
                break;
            }
        }
    }

    let subscriptions = connection.subscriptions.len();
    connection.close().await;
    let id = connection.id;
    // Dropping the last sender lets the writer flush and stop.
    drop(connection);
    if let Err(err) = writer.await {
        warn!(connection = %id, error = %err, "Writer task failed");
    }

    if let Some(metrics) = metrics() {
        metrics.ws_disconnected();
    }
    info!(connection = %id, subscriptions, "Client disconnected");
}

/// Drain the outbound queue into the sink. Stops when every sender is gone
/// or the sink fails.
async fn write_frames<O>(
    mut rx: mpsc::Receiver<Outgoing>,
    sink: O,
    ping_interval: Option<Duration>,
) where
    O: Sink<Outgoing> + Send,
    O::Error: Display,
{
    futures_util::pin_mut!(sink);
    let mut pings = ping_interval.map(|period| {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    });

    loop {
        let next = tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
            _ = next_ping(&mut pings) => Outgoing::Ping,
        };
        if let Err(err) = sink.send(next).await {
            debug!(error = %err, "Outbound sink closed");
            break;
        }
    }

    // Unblock pending deliveries; their channels report closed.
    rx.close();
    let _ = sink.close().await;
}

async fn next_ping(pings: &mut Option<tokio::time::Interval>) {
    match pings {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kinetic_bridge::BridgeConfig;
    use kinetic_test_utils::{
        fixtures, producer_fn, ComputationKey, ComputeCache, CountingProducer, KeepAlive,
        OperationRegistry,
    };
    use serde_json::{json, Value};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
    use tokio_stream::wrappers::ReceiverStream;

    struct Harness {
        client: mpsc::Sender<String>,
        frames: UnboundedReceiver<Outgoing>,
        done: tokio::task::JoinHandle<()>,
        publisher: Publisher,
    }

    impl Harness {
        fn start(options: ConnectionOptions) -> Self {
            let (cache, _) = fixtures::sample_cache();
            Self::with_cache(cache, options)
        }

        fn with_cache(cache: ComputeCache, options: ConnectionOptions) -> Self {
            let publisher = Publisher::new(cache, BridgeConfig::default());
            let (client, inbound) = mpsc::channel::<String>(16);
            let (out_tx, frames) = unbounded_channel();
            let sink = futures_util::sink::unfold(out_tx, |tx, item: Outgoing| async move {
                tx.send(item).map_err(|_| "receiver dropped")?;
                Ok::<_, &'static str>(tx)
            });
            let done = tokio::spawn(serve_connection(
                publisher.clone(),
                ReceiverStream::new(inbound),
                sink,
                options,
            ));
            Self {
                client,
                frames,
                done,
                publisher,
            }
        }

        async fn send(&self, frame: Value) {
            self.client.send(frame.to_string()).await.unwrap();
        }

        async fn next_frame(&mut self) -> Value {
            loop {
                let item = tokio::time::timeout(Duration::from_secs(2), self.frames.recv())
                    .await
                    .expect("frame within timeout")
                    .expect("connection open");
                if let Outgoing::Frame(text) = item {
                    return serde_json::from_str(&text).unwrap();
                }
            }
        }
    }

    #[tokio::test]
    async fn test_connected_then_initial_update() {
        let mut harness = Harness::start(ConnectionOptions::default());
        let connected = harness.next_frame().await;
        assert_eq!(connected["op"], "connected");
        assert_eq!(
            connected["publisherId"],
            json!(harness.publisher.id().to_string())
        );

        harness
            .send(json!({"op": "subscribe", "operationId": "sum", "args": [2, 3]}))
            .await;
        let update = harness.next_frame().await;
        assert_eq!(
            update,
            json!({"op": "update", "key": "sum(2,3)", "version": 1, "value": 5})
        );
    }

    #[tokio::test]
    async fn test_invalidation_pushes_update() {
        let mut harness = Harness::start(ConnectionOptions::default());
        harness.next_frame().await;
        harness
            .send(json!({"op": "subscribe", "operationId": "ticker"}))
            .await;
        assert_eq!(harness.next_frame().await["version"], 1);

        harness
            .publisher
            .cache()
            .invalidate(&fixtures::ticker_key());
        let update = harness.next_frame().await;
        assert_eq!(update["op"], "update");
        assert_eq!(update["version"], 2);
    }

    #[tokio::test]
    async fn test_resubscribe_resends_current_value() {
        let mut harness = Harness::start(ConnectionOptions::default());
        harness.next_frame().await;
        let subscribe = json!({"op": "subscribe", "operationId": "sum", "args": [1, 1]});

        harness.send(subscribe.clone()).await;
        assert_eq!(harness.next_frame().await["version"], 1);
        harness.send(subscribe).await;
        let again = harness.next_frame().await;
        assert_eq!(again["key"], "sum(1,1)");
        assert_eq!(again["version"], 1);
        assert_eq!(harness.publisher.stats().channels, 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_and_errors() {
        let mut harness = Harness::start(ConnectionOptions::default());
        harness.next_frame().await;

        harness
            .send(json!({"op": "unsubscribe", "key": "sum(9,9)"}))
            .await;
        let error = harness.next_frame().await;
        assert_eq!(error["op"], "error");
        assert_eq!(error["key"], "sum(9,9)");

        harness
            .send(json!({"op": "subscribe", "operationId": "missing"}))
            .await;
        let error = harness.next_frame().await;
        assert_eq!(error["op"], "error");
        assert!(error["message"].as_str().unwrap().contains("missing"));

        harness.client.send("{".to_string()).await.unwrap();
        assert_eq!(harness.next_frame().await["op"], "error");

        harness
            .send(json!({"op": "subscribe", "operationId": "sum", "args": [4, 4]}))
            .await;
        assert_eq!(harness.next_frame().await["value"], 8);
        harness
            .send(json!({"op": "unsubscribe", "key": "sum(4,4)"}))
            .await;
        assert_eq!(
            harness.next_frame().await,
            json!({"op": "unsubscribed", "key": "sum(4,4)"})
        );
        assert_eq!(harness.publisher.stats().channels, 0);
    }

    /// `slow()` takes far longer than any frame timeout; `sum` is instant.
    fn slow_cache() -> ComputeCache {
        let registry = OperationRegistry::builder()
            .operation(
                "slow",
                KeepAlive::from_secs(1),
                producer_fn(|_ctx, _args| async move {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::from("late"))
                }),
            )
            .operation("sum", KeepAlive::from_secs(1), CountingProducer::sum())
            .build()
            .unwrap();
        ComputeCache::new(registry)
    }

    #[tokio::test]
    async fn test_slow_subscribe_does_not_block_later_frames() {
        let mut harness = Harness::with_cache(slow_cache(), ConnectionOptions::default());
        harness.next_frame().await;

        harness.send(json!({"op": "subscribe", "operationId": "slow"})).await;
        harness
            .send(json!({"op": "subscribe", "operationId": "sum", "args": [1, 2]}))
            .await;
        let update = harness.next_frame().await;
        assert_eq!(update["key"], "sum(1,2)");
        assert_eq!(update["value"], 3);
    }

    #[tokio::test]
    async fn test_unsubscribe_cancels_pending_subscribe() {
        let mut harness = Harness::with_cache(slow_cache(), ConnectionOptions::default());
        harness.next_frame().await;

        harness.send(json!({"op": "subscribe", "operationId": "slow"})).await;
        harness
            .send(json!({"op": "unsubscribe", "key": "slow()"}))
            .await;
        assert_eq!(
            harness.next_frame().await,
            json!({"op": "unsubscribed", "key": "slow()"})
        );

        harness
            .send(json!({"op": "subscribe", "operationId": "sum", "args": [2, 2]}))
            .await;
        let update = harness.next_frame().await;
        assert_eq!(update["key"], "sum(2,2)");

        let slow = harness
            .publisher
            .publication(&ComputationKey::new("slow", vec![]))
            .map_or(0, |publication| publication.subscriber_count());
        assert_eq!(slow, 0);

        // A second unsubscribe finds nothing left.
        harness
            .send(json!({"op": "unsubscribe", "key": "slow()"}))
            .await;
        assert_eq!(harness.next_frame().await["op"], "error");
    }

    #[tokio::test]
    async fn test_close_cancels_pending_subscribe() {
        let harness = Harness::with_cache(slow_cache(), ConnectionOptions::default());
        harness.send(json!({"op": "subscribe", "operationId": "slow"})).await;

        let Harness {
            client,
            done,
            publisher,
            ..
        } = harness;
        drop(client);
        tokio::time::timeout(Duration::from_secs(2), done)
            .await
            .expect("connection ends without waiting for the producer")
            .unwrap();
        assert_eq!(publisher.stats().channels, 0);
    }

    #[tokio::test]
    async fn test_session_scoped_subscription() {
        let mut harness = Harness::start(ConnectionOptions::default());
        harness.next_frame().await;
        harness
            .send(json!({"op": "subscribe", "operationId": "greeting", "sessionToken": "bob"}))
            .await;
        let update = harness.next_frame().await;
        assert_eq!(update["key"], "greeting()#bob");
        assert_eq!(update["value"], "hello bob");
    }

    #[tokio::test]
    async fn test_close_unsubscribes_everything() {
        let mut harness = Harness::start(ConnectionOptions::default());
        harness.next_frame().await;
        harness
            .send(json!({"op": "subscribe", "operationId": "ticker"}))
            .await;
        harness
            .send(json!({"op": "subscribe", "operationId": "sum", "args": [1, 2]}))
            .await;
        harness.next_frame().await;
        harness.next_frame().await;
        assert_eq!(harness.publisher.stats().channels, 2);

        let Harness {
            client,
            done,
            publisher,
            ..
        } = harness;
        drop(client);
        done.await.unwrap();
        assert_eq!(publisher.stats().channels, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_writer_sends_pings() {
        let mut harness = Harness::start(ConnectionOptions {
            ping_interval: Some(Duration::from_secs(15)),
            ..ConnectionOptions::default()
        });
        harness.next_frame().await;

        tokio::time::advance(Duration::from_secs(16)).await;
        let item = tokio::time::timeout(Duration::from_secs(1), harness.frames.recv())
            .await
            .unwrap();
        assert_eq!(item, Some(Outgoing::Ping));
    }
}
