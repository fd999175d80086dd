//! TTS output scheduler.
//!
//! Turns an [`AgentTurn`](crate::dialog::AgentTurn) into outbound wire frames,
//! paced to real time so playback can't get ahead of the telephony leg, and
//! watches a [`CancellationToken`] every frame so a barge-in interrupts
//! within one frame interval rather than at the next chunk boundary. A
//! non-interruptible turn (the terminal sentence of a farewell) ignores
//! cancellation entirely and always plays to completion.

use crate::audio::codec::FrameCodec;
use crate::dialog::AgentTurn;
use crate::error::AppError;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// TTS provider interface — a pure function from text to 16 kHz PCM16.
#[async_trait]
pub trait TtsProvider: Send + Sync {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<i16>, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnOutcome {
    Completed,
    /// Cut short by a barge-in; only possible for `interruptible` turns.
    Interrupted,
    /// Synthesis itself failed; the fallback clip played instead.
    Failed,
}

/// A short, fixed "please hold" clip played in place of a turn whose
/// synthesis failed, so the caller never hears dead air. Synthetic in this
/// codebase (a few hundred ms of low-amplitude tone standing in for a
/// pre-recorded asset a production deployment would ship as a file).
fn fallback_clip_pcm(sample_rate: u32) -> Vec<i16> {
    let duration_ms = 600u32;
    let n = (sample_rate as u64 * duration_ms as u64 / 1000) as usize;
    (0..n)
        .map(|i| ((i as f32 * 0.05).sin() * 3000.0) as i16)
        .collect()
}

pub struct TtsScheduler {
    provider: Arc<dyn TtsProvider>,
    codec: FrameCodec,
    voice_id: String,
    frame_ms: u32,
    pcm_sample_rate: u32,
}

impl TtsScheduler {
    pub fn new(provider: Arc<dyn TtsProvider>, voice_id: String, frame_ms: u32, pcm_sample_rate: u32) -> Self {
        Self {
            provider,
            codec: FrameCodec::new(frame_ms),
            voice_id,
            frame_ms,
            pcm_sample_rate,
        }
    }

    /// Synthesize and play one turn. `out_tx` receives wire-ready JSON
    /// envelope strings, one per frame, paced by `frame_ms`.
    pub async fn speak(
        &self,
        turn: &AgentTurn,
        out_tx: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        match self.provider.synthesize(&turn.text, &self.voice_id).await {
            Ok(pcm) => self.play(&pcm, turn.interruptible, out_tx, cancel).await,
            Err(e) => {
                warn!(error = %e, "TTS synthesis failed, playing fallback clip");
                let fallback = fallback_clip_pcm(self.pcm_sample_rate);
                // The fallback always plays to completion regardless of the
                // turn's own interruptibility — the caller needs *some*
                // signal rather than silence.
                self.play(&fallback, false, out_tx, cancel).await;
                TurnOutcome::Failed
            }
        }
    }

    async fn play(
        &self,
        pcm: &[i16],
        interruptible: bool,
        out_tx: &mpsc::Sender<String>,
        cancel: &CancellationToken,
    ) -> TurnOutcome {
        let chunks = match self.codec.encode_outbound_chunks(pcm) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "failed to encode outbound audio, dropping turn");
                return TurnOutcome::Failed;
            }
        };

        let frame_interval = Duration::from_millis(self.frame_ms as u64);
        let mut ticker = tokio::time::interval(frame_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        for chunk in &chunks {
            ticker.tick().await;
            let envelope = FrameCodec::wrap_outbound(chunk);

            if interruptible {
                tokio::select! {
                    _ = cancel.cancelled() => return TurnOutcome::Interrupted,
                    send_result = out_tx.send(envelope) => {
                        if send_result.is_err() {
                            return TurnOutcome::Interrupted;
                        }
                    }
                }
            } else if out_tx.send(envelope).await.is_err() {
                return TurnOutcome::Interrupted;
            }
        }

        let _ = out_tx.send(FrameCodec::mark_envelope()).await;
        TurnOutcome::Completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialog::AgentIntent;

    struct StubTts {
        result: Result<Vec<i16>, AppError>,
    }

    #[async_trait]
    impl TtsProvider for StubTts {
        async fn synthesize(&self, _text: &str, _voice_id: &str) -> Result<Vec<i16>, AppError> {
            match &self.result {
                Ok(pcm) => Ok(pcm.clone()),
                Err(_) => Err(AppError::TtsFailure("boom".into())),
            }
        }
    }

    fn turn(interruptible: bool) -> AgentTurn {
        AgentTurn {
            text: "hello there".into(),
            intent: AgentIntent::Prompt,
            interruptible,
            terminal: false,
        }
    }

    #[tokio::test]
    async fn completes_an_uninterrupted_turn() {
        let scheduler = TtsScheduler::new(
            Arc::new(StubTts {
                result: Ok(vec![1000i16; 1600]),
            }),
            "voice-a".into(),
            20,
            16_000,
        );
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let outcome = scheduler.speak(&turn(true), &tx, &cancel).await;
        assert_eq!(outcome, TurnOutcome::Completed);
        drop(tx);
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert!(count > 0);
    }

    #[tokio::test]
    async fn cancellation_stops_an_interruptible_turn_early() {
        let scheduler = TtsScheduler::new(
            Arc::new(StubTts {
                result: Ok(vec![1000i16; 16_000 * 3]), // 3s of audio
            }),
            "voice-a".into(),
            20,
            16_000,
        );
        let (tx, _rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = scheduler.speak(&turn(true), &tx, &cancel).await;
        assert_eq!(outcome, TurnOutcome::Interrupted);
    }

    #[tokio::test]
    async fn synthesis_failure_plays_fallback_and_reports_failed() {
        let scheduler = TtsScheduler::new(
            Arc::new(StubTts {
                result: Err(AppError::TtsFailure("down".into())),
            }),
            "voice-a".into(),
            20,
            16_000,
        );
        let (tx, mut rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let outcome = scheduler.speak(&turn(true), &tx, &cancel).await;
        assert_eq!(outcome, TurnOutcome::Failed);
        drop(tx);
        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert!(count > 0, "fallback clip should still produce frames");
    }
}
