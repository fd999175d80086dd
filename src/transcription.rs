//! Transcription gateway: turns accepted utterances into transcripts.
//!
//! Calls out to the external STT provider (a pure function: bytes ->
//! transcript) behind a per-request timeout, then applies the confidence
//! and text-cleaning gates before a transcript is allowed to reach the
//! dialog state machine. Tracks a consecutive-failure streak so the session
//! can emit a degraded-mode event without ever terminating the call.

use crate::audio::constants::PCM_SAMPLE_RATE;
use crate::config::TranscriptionConfig;
use crate::error::AppError;
use crate::utterance::Utterance;
use async_trait::async_trait;
use std::time::Duration;

/// An accepted, immutable transcript.
#[derive(Debug, Clone)]
pub struct Transcript {
    pub text: String,
    pub avg_log_prob: f32,
    pub utterance_id: u64,
}

/// Raw provider response, before confidence/cleaning gates are applied.
#[derive(Debug, Clone)]
pub struct RawTranscript {
    pub text: String,
    pub avg_log_prob: f32,
}

/// STT provider interface — the only thing this module knows about the
/// external speech-to-text system.
#[async_trait]
pub trait SttProvider: Send + Sync {
    async fn transcribe(&self, pcm16k: &[i16], sample_rate: u32) -> Result<RawTranscript, AppError>;
}

/// Phrases whisper-style models commonly hallucinate on silence or
/// low-energy segments. Matched case-insensitively after whitespace
/// collapse and trailing-punctuation trim.
const HALLUCINATION_DENY_LIST: &[&str] = &[
    "thank you",
    "thanks for watching",
    "thank you for watching",
    "subscribe",
    "like and subscribe",
    "bye",
    "bye bye",
    "you",
    "the end",
    "so",
    "hmm",
    "uh",
    "oh",
];

pub enum TranscriptOutcome {
    Accepted(Transcript),
    /// Low confidence or failed cleaning — not a provider error, just not
    /// usable; the dialog layer treats this as "unintelligible" input.
    Rejected,
    /// The provider call itself failed (timeout, 5xx, 4xx/auth).
    ProviderError(AppError),
}

pub struct TranscriptionGateway {
    provider: std::sync::Arc<dyn SttProvider>,
    cfg: TranscriptionConfig,
    consecutive_failures: u32,
}

impl TranscriptionGateway {
    pub fn new(provider: std::sync::Arc<dyn SttProvider>, cfg: TranscriptionConfig) -> Self {
        Self {
            provider,
            cfg,
            consecutive_failures: 0,
        }
    }

    /// Submit one utterance. Never panics and never returns an error the
    /// caller must propagate across the session boundary — provider
    /// failures are represented in `TranscriptOutcome::ProviderError`.
    pub async fn submit(&mut self, utterance: &Utterance) -> TranscriptOutcome {
        let call = self.provider.transcribe(&utterance.pcm, PCM_SAMPLE_RATE);
        let result = tokio::time::timeout(self.cfg.request_timeout, call).await;

        let raw = match result {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                self.consecutive_failures += 1;
                return TranscriptOutcome::ProviderError(e);
            }
            Err(_elapsed) => {
                self.consecutive_failures += 1;
                return TranscriptOutcome::ProviderError(AppError::SttTransient(
                    "STT request timed out".into(),
                ));
            }
        };

        self.consecutive_failures = 0;

        if raw.avg_log_prob < self.cfg.confidence_threshold {
            return TranscriptOutcome::Rejected;
        }

        match clean_text(&raw.text) {
            Some(text) => TranscriptOutcome::Accepted(Transcript {
                text,
                avg_log_prob: raw.avg_log_prob,
                utterance_id: utterance.id,
            }),
            None => TranscriptOutcome::Rejected,
        }
    }

    /// Whether the consecutive-failure streak has crossed the degraded-mode
    /// threshold. The session publishes a degraded event on the transition,
    /// not on every subsequent failure.
    pub fn is_degraded(&self) -> bool {
        self.consecutive_failures >= self.cfg.consecutive_failure_streak
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn request_timeout(&self) -> Duration {
        self.cfg.request_timeout
    }
}

/// Collapse whitespace, strip known hallucinations, and reject
/// punctuation-only or too-short text. Returns `None` if nothing usable
/// survives.
fn clean_text(raw: &str) -> Option<String> {
    let collapsed: String = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        return None;
    }

    let trimmed_punct = collapsed.trim_end_matches(|c: char| c == '.' || c == '!' || c == '?');
    let lower = trimmed_punct.to_lowercase();
    if HALLUCINATION_DENY_LIST.iter().any(|h| lower == *h) {
        return None;
    }

    if collapsed.chars().all(|c| c.is_ascii_punctuation() || c.is_whitespace()) {
        return None;
    }

    if collapsed.chars().count() < 2 {
        return None;
    }

    Some(collapsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct StubProvider {
        response: Result<RawTranscript, AppError>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl SttProvider for StubProvider {
        async fn transcribe(&self, _pcm16k: &[i16], _sample_rate: u32) -> Result<RawTranscript, AppError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(r) => Ok(r.clone()),
                Err(_) => Err(AppError::SttTransient("boom".into())),
            }
        }
    }

    fn test_cfg() -> TranscriptionConfig {
        TranscriptionConfig {
            confidence_threshold: -0.7,
            min_utterance_ms: 500,
            min_utterance_rms: 60,
            request_timeout: Duration::from_secs(8),
            consecutive_failure_streak: 5,
        }
    }

    fn mk_utterance() -> Utterance {
        Utterance {
            id: 1,
            pcm: vec![0; 100],
            started_at: std::time::Instant::now(),
            ended_at: std::time::Instant::now(),
            peak_rms: 200.0,
        }
    }

    #[tokio::test]
    async fn accepts_clean_high_confidence_transcript() {
        let provider = Arc::new(StubProvider {
            response: Ok(RawTranscript {
                text: "I need a haircut".into(),
                avg_log_prob: -0.2,
            }),
            calls: AtomicU32::new(0),
        });
        let mut gw = TranscriptionGateway::new(provider, test_cfg());
        match gw.submit(&mk_utterance()).await {
            TranscriptOutcome::Accepted(t) => assert_eq!(t.text, "I need a haircut"),
            _ => panic!("expected acceptance"),
        }
        assert_eq!(gw.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn rejects_low_confidence_transcript() {
        let provider = Arc::new(StubProvider {
            response: Ok(RawTranscript {
                text: "I need a haircut".into(),
                avg_log_prob: -2.0,
            }),
            calls: AtomicU32::new(0),
        });
        let mut gw = TranscriptionGateway::new(provider, test_cfg());
        assert!(matches!(gw.submit(&mk_utterance()).await, TranscriptOutcome::Rejected));
    }

    #[tokio::test]
    async fn filters_hallucination_phrase() {
        let provider = Arc::new(StubProvider {
            response: Ok(RawTranscript {
                text: "Thank you for watching.".into(),
                avg_log_prob: -0.1,
            }),
            calls: AtomicU32::new(0),
        });
        let mut gw = TranscriptionGateway::new(provider, test_cfg());
        assert!(matches!(gw.submit(&mk_utterance()).await, TranscriptOutcome::Rejected));
    }

    #[tokio::test]
    async fn tracks_consecutive_failure_streak_and_degraded_threshold() {
        let provider = Arc::new(StubProvider {
            response: Err(AppError::SttTransient("down".into())),
            calls: AtomicU32::new(0),
        });
        let mut gw = TranscriptionGateway::new(provider, test_cfg());
        for _ in 0..4 {
            assert!(matches!(
                gw.submit(&mk_utterance()).await,
                TranscriptOutcome::ProviderError(_)
            ));
            assert!(!gw.is_degraded());
        }
        gw.submit(&mk_utterance()).await;
        assert!(gw.is_degraded());
    }

    #[tokio::test]
    async fn success_resets_failure_streak() {
        let failing = Arc::new(StubProvider {
            response: Err(AppError::SttTransient("down".into())),
            calls: AtomicU32::new(0),
        });
        let mut gw = TranscriptionGateway::new(failing, test_cfg());
        for _ in 0..5 {
            gw.submit(&mk_utterance()).await;
        }
        assert!(gw.is_degraded());

        let succeeding = Arc::new(StubProvider {
            response: Ok(RawTranscript {
                text: "hello there".into(),
                avg_log_prob: -0.1,
            }),
            calls: AtomicU32::new(0),
        });
        gw.provider = succeeding;
        gw.submit(&mk_utterance()).await;
        assert_eq!(gw.consecutive_failures(), 0);
    }

    #[test]
    fn clean_text_rejects_punctuation_only() {
        assert!(clean_text("...").is_none());
        assert!(clean_text("?!").is_none());
    }

    #[test]
    fn clean_text_rejects_too_short() {
        assert!(clean_text("a").is_none());
        assert!(clean_text("").is_none());
    }

    #[test]
    fn clean_text_collapses_whitespace() {
        assert_eq!(clean_text("hello    world").unwrap(), "hello world");
    }
}
