//! End-to-end WebSocket tests against a real listener.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use kinetic_api::{create_router, sample_state, AppState, ServerConfig, TransportConfig};
use kinetic_bridge::BridgeConfig;
use kinetic_compute::ComputeConfig;
use kinetic_core::ComputationKey;
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const FRAME_TIMEOUT: Duration = Duration::from_secs(5);

async fn start_server() -> (SocketAddr, AppState) {
    let state = sample_state(
        ComputeConfig::default(),
        BridgeConfig::default(),
        TransportConfig::default(),
    )
    .unwrap();
    let router = create_router(state.clone(), &ServerConfig::default());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (addr, state)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, _response) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
    client
}

/// Next text frame as JSON, skipping control frames.
async fn next_frame(client: &mut Client) -> Value {
    loop {
        let message = tokio::time::timeout(FRAME_TIMEOUT, client.next())
            .await
            .expect("frame before timeout")
            .expect("stream open")
            .expect("valid message");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).unwrap();
        }
    }
}

async fn send(client: &mut Client, frame: Value) {
    client.send(Message::Text(frame.to_string())).await.unwrap();
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(FRAME_TIMEOUT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition before timeout");
}

#[tokio::test]
async fn test_subscribe_receives_current_and_newer_versions() {
    let (addr, state) = start_server().await;
    let mut client = connect(addr).await;

    let connected = next_frame(&mut client).await;
    assert_eq!(connected["op"], "connected");
    assert_eq!(connected["publisherId"], state.publisher.id().to_string());
    assert!(connected["connectionId"].is_string());

    send(
        &mut client,
        json!({"op": "subscribe", "operationId": "sum", "args": [2, 3]}),
    )
    .await;
    let first = next_frame(&mut client).await;
    assert_eq!(first["op"], "update");
    assert_eq!(first["key"], "sum(2,3)");
    assert_eq!(first["version"], 1);
    assert_eq!(first["value"], 5);

    state
        .cache
        .invalidate(&ComputationKey::new("sum", vec![json!(2), json!(3)]));
    let second = next_frame(&mut client).await;
    assert_eq!(second["key"], "sum(2,3)");
    assert_eq!(second["version"], 2);
    assert_eq!(second["value"], 5);

    send(&mut client, json!({"op": "unsubscribe", "key": "sum(2,3)"})).await;
    let unsubscribed = next_frame(&mut client).await;
    assert_eq!(unsubscribed, json!({"op": "unsubscribed", "key": "sum(2,3)"}));
}

#[tokio::test]
async fn test_errors_are_reported_on_the_connection() {
    let (addr, _state) = start_server().await;
    let mut client = connect(addr).await;
    next_frame(&mut client).await;

    send(&mut client, json!({"op": "subscribe", "operationId": "nope"})).await;
    let error = next_frame(&mut client).await;
    assert_eq!(error["op"], "error");
    assert!(error["message"].is_string());
    assert!(error["key"].is_null());

    client
        .send(Message::Text("not json".to_string()))
        .await
        .unwrap();
    let error = next_frame(&mut client).await;
    assert_eq!(error["op"], "error");

    // The connection survives both errors.
    send(
        &mut client,
        json!({"op": "subscribe", "operationId": "sum", "args": [1, 1]}),
    )
    .await;
    let update = next_frame(&mut client).await;
    assert_eq!(update["value"], 2);
}

#[tokio::test]
async fn test_session_token_scopes_subscription() {
    let (addr, _state) = start_server().await;
    let mut client = connect(addr).await;
    next_frame(&mut client).await;

    send(
        &mut client,
        json!({
            "op": "subscribe",
            "operationId": "composed",
            "args": ["abc"],
            "sessionToken": "carol"
        }),
    )
    .await;
    let update = next_frame(&mut client).await;
    assert_eq!(update["key"], "composed(\"abc\")#carol");
    assert_eq!(update["value"]["session"], "carol");
    assert_eq!(update["value"]["parameter"], "abc");
}

#[tokio::test]
async fn test_disconnect_unsubscribes() {
    let (addr, state) = start_server().await;
    let mut client = connect(addr).await;
    next_frame(&mut client).await;

    send(
        &mut client,
        json!({"op": "subscribe", "operationId": "sum", "args": [7, 8]}),
    )
    .await;
    next_frame(&mut client).await;
    let publisher = state.publisher.clone();
    wait_until(move || publisher.stats().channels == 1).await;

    client.close(None).await.unwrap();
    drop(client);

    let publisher = state.publisher.clone();
    wait_until(move || publisher.stats().channels == 0).await;
    assert_eq!(state.publisher.stats().subscriptions_closed, 1);
}

#[tokio::test]
async fn test_two_clients_share_a_publication() {
    let (addr, state) = start_server().await;
    let mut alice = connect(addr).await;
    let mut bob = connect(addr).await;
    next_frame(&mut alice).await;
    next_frame(&mut bob).await;

    let subscribe = json!({"op": "subscribe", "operationId": "sum", "args": [10, 20]});
    send(&mut alice, subscribe.clone()).await;
    send(&mut bob, subscribe).await;
    assert_eq!(next_frame(&mut alice).await["version"], 1);
    assert_eq!(next_frame(&mut bob).await["version"], 1);
    let publisher = state.publisher.clone();
    wait_until(move || publisher.stats().channels == 2).await;
    assert_eq!(state.publisher.stats().publications, 1);

    state
        .cache
        .invalidate(&ComputationKey::new("sum", vec![json!(10), json!(20)]));
    assert_eq!(next_frame(&mut alice).await["version"], 2);
    assert_eq!(next_frame(&mut bob).await["version"], 2);
}
