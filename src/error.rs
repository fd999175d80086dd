//! Error kinds for the call pipeline.
//!
//! One error enum for the whole crate: each variant is handled locally wherever the
//! caller experience can continue, and never propagated across a session
//! boundary (`session::Session` catches everything a pipeline stage can
//! return and turns it into a structured operator event or a reprompt).

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("frame envelope could not be parsed: {0}")]
    FrameMalformed(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("STT request timed out or the provider returned a transient error: {0}")]
    SttTransient(String),

    #[error("STT provider rejected the request (auth/4xx): {0}")]
    SttPermanent(String),

    #[error("TTS synthesis failed: {0}")]
    TtsFailure(String),

    #[error("NLU extraction failed: {0}")]
    NluFailure(String),

    #[error("operator did not respond within the approval window")]
    OperatorTimeout,

    #[error("media WebSocket dropped")]
    WebSocketDropped,

    #[error("missing required configuration: {0}")]
    ConfigMissing(String),
}

impl AppError {
    /// Short machine-readable tag, used as the `reason` field on degraded /
    /// error operator events. Keep stable — operators and tests match on it.
    pub fn reason_code(&self) -> &'static str {
        match self {
            AppError::FrameMalformed(_) => "frame_malformed",
            AppError::Codec(_) => "codec_error",
            AppError::SttTransient(_) => "stt_transient",
            AppError::SttPermanent(_) => "stt_permanent",
            AppError::TtsFailure(_) => "tts_failure",
            AppError::NluFailure(_) => "nlu_failure",
            AppError::OperatorTimeout => "operator_timeout",
            AppError::WebSocketDropped => "websocket_dropped",
            AppError::ConfigMissing(_) => "config_missing",
        }
    }

    /// Whether this error should terminate the call (vs. recover in place).
    pub fn is_fatal_to_call(&self) -> bool {
        matches!(
            self,
            AppError::SttPermanent(_) | AppError::WebSocketDropped
        )
    }
}
