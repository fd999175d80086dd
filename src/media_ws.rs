//! Media WebSocket handler (`/media/:call_id`).
//!
//! The provider opens this socket after the webhook directive; from here on
//! the call is live. This module's only job is bridging the raw WebSocket
//! to the bounded string channels [`crate::session::spawn`] expects — all
//! framing, VAD, dialog, and TTS logic lives in [`crate::session`]. Pattern
//! (split socket, one reader task, one writer task, `tokio::select!` join)
//! keeps the reader loop free to return as soon as the provider closes, while
//! the writer drains whatever the session still has queued.

use crate::session::{self, AppState, MediaChannels};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Depth of the raw-frame channels between the WebSocket and the session's
/// inbound/outbound pipeline tasks. Generous relative to the utterance
/// queue's depth since these carry per-20/30ms wire frames, not accumulated
/// utterances.
const SOCKET_CHANNEL_DEPTH: usize = 64;

pub async fn media_ws_handler(
    Path(call_id): Path<String>,
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_media_socket(socket, call_id, state))
}

async fn handle_media_socket(socket: WebSocket, call_id: String, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    let (inbound_tx, inbound_rx) = mpsc::channel::<String>(SOCKET_CHANNEL_DEPTH);
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(SOCKET_CHANNEL_DEPTH);

    // The webhook allocates the call record at accept time; the socket only
    // carries the call id, so `from`/`to` are recovered from that record
    // here, once, before the pipeline tasks start.
    let record = state.pending_calls.take(&call_id);
    let (from, to) = match record {
        Some(r) => (r.from, r.to),
        None => {
            warn!(call_id = %call_id, "media socket opened with no matching webhook accept");
            (None, None)
        }
    };

    session::spawn(
        call_id.clone(),
        from,
        to,
        state.config.clone(),
        state.event_bus.clone(),
        state.providers.clone(),
        MediaChannels { inbound_rx, outbound_tx },
        state.registry.clone(),
    );

    // Writer: session's outbound frames -> the wire. Ends when the session
    // drops `outbound_tx` (call ended) or the socket write fails.
    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound_rx.recv().await {
            if ws_tx.send(Message::Text(envelope.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    // Reader: the wire -> session's inbound pipeline. Only text frames
    // carry the provider's JSON envelope; anything else is ignored
    // rather than treated as fatal.
    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                if inbound_tx.send(text.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(Message::Close(_)) => {
                info!(call_id = %call_id, "media websocket closed by provider");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!(call_id = %call_id, error = %e, "media websocket read error");
                break;
            }
        }
    }
    drop(inbound_tx);

    let _ = writer.await;
}
