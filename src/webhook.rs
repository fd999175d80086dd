//! Telephony control webhook: the HTTP POST the provider fires on an
//! inbound call. Allocates the call's [`crate::session::CallRecord`] right
//! here, at accept time, then responds with a directive instructing the
//! provider to open the media WebSocket at `wss://<host>/media/<call_id>`.
//! The pipeline tasks themselves aren't spawned until the provider actually
//! opens that socket (see [`crate::media_ws`]) — this handler's job is only
//! to remember `from`/`to` against the call id and hand back the directive.

use crate::session::{AppState, CallRecord};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;

/// Accepts both form-encoded and JSON bodies — telephony providers vary in
/// which they POST. Field names cover the common aliases
/// (`CallSid`/`call_id`, `From`/`from`, `To`/`to`).
#[derive(Debug, Deserialize)]
pub struct IncomingCall {
    #[serde(alias = "CallSid", alias = "call_id", alias = "callId")]
    pub call_id: String,
    #[serde(alias = "From", default)]
    pub from: Option<String>,
    #[serde(alias = "To", default)]
    pub to: Option<String>,
}

#[derive(Debug, Serialize)]
struct MediaStreamDirective {
    action: &'static str,
    url: String,
}

/// `POST /webhook`. Parses whichever of JSON or `application/x-www-form-urlencoded`
/// the provider sent, and returns the directive to open the media stream.
pub async fn incoming_call_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    let content_type = headers
        .get(axum::http::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let parsed: Result<IncomingCall, String> = if content_type.contains("json") {
        serde_json::from_slice(&body).map_err(|e| e.to_string())
    } else {
        serde_urlencoded::from_bytes(&body).map_err(|e| e.to_string())
    };

    let call = match parsed {
        Ok(call) => call,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "could not parse webhook payload", "details": e })),
            )
                .into_response();
        }
    };

    info!(call_id = %call.call_id, from = ?call.from, to = ?call.to, "inbound call accepted");

    state.pending_calls.insert(CallRecord {
        call_id: call.call_id.clone(),
        from: call.from.clone(),
        to: call.to.clone(),
        created_at: Utc::now(),
    });

    let host = headers
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("localhost");

    let directive = MediaStreamDirective {
        action: "connect_media_stream",
        url: format!("wss://{host}/media/{}", call.call_id),
    };

    (StatusCode::OK, Json(directive)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_twilio_style_form_field_names() {
        let parsed: IncomingCall = serde_urlencoded::from_str("CallSid=CA123&From=%2B15551230000&To=%2B15559990000").unwrap();
        assert_eq!(parsed.call_id, "CA123");
        assert_eq!(parsed.from.as_deref(), Some("+15551230000"));
    }

    #[test]
    fn deserializes_plain_json_field_names() {
        let parsed: IncomingCall = serde_json::from_str(r#"{"call_id":"C1","from":"555","to":"556"}"#).unwrap();
        assert_eq!(parsed.call_id, "C1");
    }
}
