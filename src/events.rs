//! Event bus for the operator-facing call lifecycle stream.
//!
//! A single process-wide `tokio::sync::broadcast` channel fans every call's
//! lifecycle events out to however many operator WebSocket connections are
//! currently subscribed. Each call gets its own monotonic sequence number so
//! an operator UI can detect gaps; a lagged receiver gets a synthetic
//! `Lagged` event instead of silently missing entries.

use crate::dialog::slots::Slots;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperatorEvent {
    CallStarted { from: Option<String>, to: Option<String> },
    Transcript { text: String, confidence: f32 },
    AgentSaid { text: String },
    BookingPending { slots: Slots },
    BookingConfirmed { slots: Slots },
    BookingRejected { slots: Slots },
    CallEnded { reason: String },
    /// STT failures have crossed the consecutive-failure streak: the call is
    /// NOT terminated, just flagged as degraded for the operator.
    Degraded { reason: String },
    Keepalive,
    Lagged { skipped: u64 },
}

#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub call_id: Option<String>,
    pub seq: u64,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: OperatorEvent,
}

const BUS_CAPACITY: usize = 1024;

pub struct EventBus {
    tx: broadcast::Sender<EventEnvelope>,
    sequences: DashMap<String, u64>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BUS_CAPACITY);
        Self {
            tx,
            sequences: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.tx.subscribe()
    }

    /// Publish a call-scoped event. Sequence numbers are per-`call_id` and
    /// start at 1. A send with no subscribers is not an error — the bus
    /// doesn't know or care whether an operator is watching.
    pub fn publish(&self, call_id: &str, event: OperatorEvent) {
        let seq = {
            let mut entry = self.sequences.entry(call_id.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };
        let _ = self.tx.send(EventEnvelope {
            call_id: Some(call_id.to_string()),
            seq,
            at: Utc::now(),
            event,
        });
    }

    /// Bus-wide heartbeat, not scoped to any call.
    pub fn publish_keepalive(&self) {
        let _ = self.tx.send(EventEnvelope {
            call_id: None,
            seq: 0,
            at: Utc::now(),
            event: OperatorEvent::Keepalive,
        });
    }

    pub fn forget_call(&self, call_id: &str) {
        self.sequences.remove(call_id);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Drains a subscriber's receiver into envelopes, translating a lagged
/// receiver into a synthetic `Lagged` event rather than returning an error
/// the WebSocket handler would have to special-case.
pub async fn recv_or_lagged(rx: &mut broadcast::Receiver<EventEnvelope>) -> Option<EventEnvelope> {
    loop {
        match rx.recv().await {
            Ok(envelope) => return Some(envelope),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                return Some(EventEnvelope {
                    call_id: None,
                    seq: 0,
                    at: Utc::now(),
                    event: OperatorEvent::Lagged { skipped },
                });
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
