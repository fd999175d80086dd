//! Speech/silence segmenter.
//!
//! Wraps `webrtc_vad::Vad` with an aggressiveness mode and a hangover window
//! in a small state machine that emits `SpeechStart` / `SpeechEnd`
//! boundaries. The segmenter holds no audio — it only classifies frames
//! handed to it and reports transitions; [`crate::utterance`] is responsible
//! for buffering the PCM between boundaries.

use crate::audio::frame::Frame;
use crate::config::VadConfig;
use crate::error::AppError;
use std::time::Duration;
use webrtc_vad::{SampleRate, Vad, VadMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    SpeechStart,
    /// `forced` is set when emitted by `force_end` (session shutdown),
    /// rather than by natural silence detection.
    SpeechEnd { forced: bool },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Still inside the pre-roll discard window; frames are not classified.
    Preroll,
    Silence,
    Speech,
}

fn mode_from_aggressiveness(level: u8) -> VadMode {
    match level {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    }
}

/// Per-call speech/silence segmenter.
pub struct Segmenter {
    vad: Vad,
    cfg: VadConfig,
    state: State,
    preroll_remaining: Duration,
    silence_run: Duration,
    /// Elapsed time since the current speech region opened, counting every
    /// frame (speech or silence) while in `State::Speech`. Gates `SpeechEnd`
    /// emission on the configured minimum-speech-duration: a blip that goes
    /// silent before reaching it closes the region without emitting a
    /// boundary, so nothing downstream transcribes it.
    speech_region_elapsed: Duration,
    frame_duration: Duration,
}

impl Segmenter {
    pub fn new(cfg: VadConfig) -> Result<Self, AppError> {
        if cfg.frame_ms != 20 && cfg.frame_ms != 30 {
            return Err(AppError::Codec(format!(
                "unsupported VAD frame duration: {}ms",
                cfg.frame_ms
            )));
        }
        let mut vad = Vad::new();
        vad.set_mode(mode_from_aggressiveness(cfg.aggressiveness));
        let _ = vad.set_sample_rate(SampleRate::Rate16kHz);

        Ok(Self {
            vad,
            preroll_remaining: cfg.preroll_ignore,
            frame_duration: Duration::from_millis(cfg.frame_ms as u64),
            silence_run: Duration::ZERO,
            speech_region_elapsed: Duration::ZERO,
            state: if cfg.preroll_ignore.is_zero() {
                State::Silence
            } else {
                State::Preroll
            },
            cfg,
        })
    }

    /// Classify one frame and advance the state machine.
    ///
    /// Never looks ahead — every decision is made from the current frame
    /// plus accumulated counters, so the maximum latency to a SpeechEnd is
    /// exactly the configured silence timeout.
    pub fn process(&mut self, frame: &Frame) -> Result<Option<VadEvent>, AppError> {
        if self.state == State::Preroll {
            self.preroll_remaining = self.preroll_remaining.saturating_sub(self.frame_duration);
            if self.preroll_remaining.is_zero() {
                self.state = State::Silence;
            }
            return Ok(None);
        }

        let is_speech_frame = self
            .vad
            .is_voice_segment(&samples_for_vad(frame))
            .unwrap_or(false);
        let rms_ok = frame.rms() >= self.cfg.min_start_rms as f64;

        match self.state {
            State::Preroll => unreachable!("handled above"),
            State::Silence => {
                if is_speech_frame && rms_ok {
                    self.state = State::Speech;
                    self.silence_run = Duration::ZERO;
                    self.speech_region_elapsed = Duration::ZERO;
                    Ok(Some(VadEvent::SpeechStart))
                } else {
                    Ok(None)
                }
            }
            State::Speech => {
                self.speech_region_elapsed += self.frame_duration;
                if is_speech_frame {
                    self.silence_run = Duration::ZERO;
                    Ok(None)
                } else {
                    self.silence_run += self.frame_duration;
                    if self.silence_run >= self.cfg.silence_timeout {
                        self.state = State::Silence;
                        self.silence_run = Duration::ZERO;
                        if self.speech_region_elapsed >= self.cfg.min_speech {
                            Ok(Some(VadEvent::SpeechEnd { forced: false }))
                        } else {
                            // Region never reached the minimum speech
                            // duration: close it silently, no boundary event.
                            Ok(None)
                        }
                    } else {
                        Ok(None)
                    }
                }
            }
        }
    }

    /// Called on session termination to flush an in-flight utterance.
    pub fn force_end(&mut self) -> Option<VadEvent> {
        if self.state == State::Speech {
            self.state = State::Silence;
            self.silence_run = Duration::ZERO;
            Some(VadEvent::SpeechEnd { forced: true })
        } else {
            None
        }
    }

    pub fn is_in_speech(&self) -> bool {
        self.state == State::Speech
    }
}

/// webrtc_vad expects frames sized exactly to one of its supported
/// durations; our frames are already built at the configured duration, so
/// this just re-borrows the sample slice.
fn samples_for_vad(frame: &Frame) -> &[i16] {
    &frame.samples
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn test_cfg(preroll: StdDuration) -> VadConfig {
        VadConfig {
            aggressiveness: 2,
            frame_ms: 30,
            silence_timeout: StdDuration::from_millis(60),
            min_speech: StdDuration::from_millis(30),
            preroll_ignore: preroll,
            min_start_rms: 100,
        }
    }

    fn loud_frame() -> Frame {
        // A 1kHz-ish tone at high amplitude so webrtc_vad classifies it speech
        // and the RMS gate passes.
        let samples: Vec<i16> = (0..480)
            .map(|i| ((i as f32 * 0.3).sin() * 12000.0) as i16)
            .collect();
        Frame::new(samples)
    }

    fn silent_frame() -> Frame {
        Frame::new(vec![0i16; 480])
    }

    #[test]
    fn preroll_frames_are_never_classified() {
        let mut seg = Segmenter::new(test_cfg(StdDuration::from_millis(60))).unwrap();
        assert!(seg.process(&loud_frame()).unwrap().is_none());
        assert!(seg.process(&loud_frame()).unwrap().is_none());
    }

    #[test]
    fn quiet_loud_frame_does_not_start_speech() {
        let mut seg = Segmenter::new(test_cfg(StdDuration::ZERO)).unwrap();
        let quiet = Frame::new(vec![10i16; 480]);
        assert!(seg.process(&quiet).unwrap().is_none());
    }

    #[test]
    fn force_end_on_idle_segmenter_is_noop() {
        let mut seg = Segmenter::new(test_cfg(StdDuration::ZERO)).unwrap();
        assert!(seg.force_end().is_none());
    }

    #[test]
    fn speech_region_shorter_than_min_speech_closes_without_an_end_event() {
        let mut cfg = test_cfg(StdDuration::ZERO);
        cfg.min_speech = StdDuration::from_millis(200); // > 2 frames of 30ms
        let mut seg = Segmenter::new(cfg).unwrap();

        let start = seg.process(&loud_frame()).unwrap();
        assert_eq!(start, Some(VadEvent::SpeechStart));
        assert!(seg.is_in_speech());

        // silence_timeout is 60ms (2 frames); the region is only 90ms old
        // when silence crosses that threshold, well under the 200ms floor.
        assert!(seg.process(&silent_frame()).unwrap().is_none());
        let end = seg.process(&silent_frame()).unwrap();
        assert_eq!(end, None, "region never reached min_speech, so no boundary fires");
        assert!(!seg.is_in_speech(), "state still closes even without emitting the event");
    }

    #[test]
    fn force_end_while_in_speech_emits_forced_end() {
        let mut seg = Segmenter::new(test_cfg(StdDuration::ZERO)).unwrap();
        let ev = seg.process(&loud_frame()).unwrap();
        if ev == Some(VadEvent::SpeechStart) {
            let forced = seg.force_end();
            assert_eq!(forced, Some(VadEvent::SpeechEnd { forced: true }));
        }
    }
}
