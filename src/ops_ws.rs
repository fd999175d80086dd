//! Operator WebSocket handler (`/ops`).
//!
//! Server -> client: every event the [`crate::events::EventBus`] has seen,
//! in arrival order, with a `Lagged` substitute if this subscriber falls
//! behind. Client -> server: `approve`/`reject` commands, routed to the
//! owning [`crate::session::Session`] by call id via the
//! [`crate::session::SessionRegistry`]. Commands for an unknown or already
//! terminated call id get a `not_found` acknowledgement rather than being
//! silently dropped.

use crate::events::recv_or_lagged;
use crate::session::{AppState, OperatorCommand};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum OperatorCommandMessage {
    Approve {
        call_id: String,
        #[serde(default)]
        booking_id: Option<String>,
        #[serde(default)]
        note: Option<String>,
    },
    Reject {
        call_id: String,
        #[serde(default)]
        booking_id: Option<String>,
        #[serde(default)]
        note: Option<String>,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Ack {
    Ok { call_id: String },
    NotFound { call_id: String },
}

pub async fn ops_ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ops_socket(socket, state))
}

async fn handle_ops_socket(socket: WebSocket, state: AppState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut events = state.event_bus.subscribe();

    // Everything bound for the client — event-bus envelopes and command
    // acks alike — funnels through one channel so there's a single writer
    // on the socket.
    let (out_tx, mut out_rx) = mpsc::channel::<String>(256);

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    let forward_tx = out_tx.clone();
    let forward = tokio::spawn(async move {
        while let Some(envelope) = recv_or_lagged(&mut events).await {
            let Ok(text) = serde_json::to_string(&envelope) else {
                continue;
            };
            if forward_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                handle_command_text(&text, &state, &out_tx).await;
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "operator websocket read error");
                break;
            }
        }
    }

    forward.abort();
    drop(out_tx);
    let _ = writer.await;
}

async fn handle_command_text(text: &str, state: &AppState, out_tx: &mpsc::Sender<String>) {
    let parsed: OperatorCommandMessage = match serde_json::from_str(text) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "malformed operator command");
            return;
        }
    };

    let (call_id, command) = match parsed {
        OperatorCommandMessage::Approve { call_id, .. } => (call_id, OperatorCommand::Approve),
        OperatorCommandMessage::Reject { call_id, .. } => (call_id, OperatorCommand::Reject),
    };

    let ack = match state.registry.get(&call_id) {
        Some(handle) => {
            handle.send_command(command).await;
            Ack::Ok { call_id }
        }
        None => {
            warn!(call_id = %call_id, "operator command for unknown or terminated call");
            Ack::NotFound { call_id }
        }
    };

    if let Ok(text) = serde_json::to_string(&ack) {
        let _ = out_tx.send(text).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_approve_command() {
        let parsed: OperatorCommandMessage =
            serde_json::from_str(r#"{"type":"approve","call_id":"C1","booking_id":"b1"}"#).unwrap();
        match parsed {
            OperatorCommandMessage::Approve { call_id, .. } => assert_eq!(call_id, "C1"),
            _ => panic!("expected approve"),
        }
    }

    #[test]
    fn parses_reject_command_with_note() {
        let parsed: OperatorCommandMessage =
            serde_json::from_str(r#"{"type":"reject","call_id":"C1","booking_id":"b1","note":"bad address"}"#)
                .unwrap();
        match parsed {
            OperatorCommandMessage::Reject { note, .. } => assert_eq!(note.as_deref(), Some("bad address")),
            _ => panic!("expected reject"),
        }
    }

    #[test]
    fn ack_not_found_serializes_with_snake_case_type() {
        let ack = Ack::NotFound { call_id: "C1".into() };
        let json = serde_json::to_string(&ack).unwrap();
        assert!(json.contains("\"type\":\"not_found\""));
    }
}
