//! WebSocket endpoint.
//!
//! Adapts an axum WebSocket to the transport-agnostic connection core:
//! text messages become client frames, outgoing frames become text messages,
//! and the writer sends a ping every keep-alive period. Inbound messages
//! larger than the configured limit close the connection.
//!
//! ## Protocol
//!
//! 1. Client connects to `GET /ws`
//! 2. Server sends `connected` with the publisher and connection ids
//! 3. Client sends `subscribe` / `unsubscribe` frames
//! 4. Server sends `update` frames: the current value on subscribe, then
//!    every newer version
//! 5. On disconnect, every subscription of the connection is dropped

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{future, SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::connection::{serve_connection, ConnectionOptions, Outgoing};
use crate::state::AppState;

/// WebSocket upgrade handler.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let limit = state.transport.max_message_bytes;
    info!(max_message_bytes = limit, "WebSocket connection request");

    ws.max_message_size(limit)
        .max_frame_size(limit)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run one WebSocket connection to completion.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (sender, receiver) = socket.split();

    let outbound = sender.with(|outgoing: Outgoing| {
        future::ready(Ok::<_, axum::Error>(match outgoing {
            Outgoing::Frame(text) => Message::Text(text),
            Outgoing::Ping => Message::Ping(Vec::new()),
        }))
    });

    let inbound = receiver
        .take_while(|message| {
            future::ready(match message {
                Ok(Message::Close(_)) => {
                    debug!("Client sent close frame");
                    false
                }
                Ok(_) => true,
                Err(e) => {
                    warn!(error = %e, "WebSocket receive error");
                    false
                }
            })
        })
        .filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(text),
                Ok(Message::Binary(data)) => {
                    debug!(len = data.len(), "Received binary message (ignored)");
                    None
                }
                // Pings are answered by axum.
                _ => None,
            })
        });

    serve_connection(
        state.publisher.clone(),
        inbound,
        outbound,
        ConnectionOptions::from_transport(&state.transport),
    )
    .await;
}
