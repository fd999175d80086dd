//! Utterance buffer: accumulates PCM between VAD boundaries.
//!
//! Single-writer accumulator: the inbound pipeline task owns it exclusively.
//! Between `SpeechStart` and `SpeechEnd` it appends PCM; on `SpeechEnd` it
//! applies the duration/RMS gates and, if the utterance passes, hands it to
//! the transcription gateway via a bounded queue that drops the oldest
//! entry rather than ever blocking the inbound loop.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::warn;

/// An accepted, immutable utterance ready for transcription.
#[derive(Debug, Clone)]
pub struct Utterance {
    pub id: u64,
    pub pcm: Vec<i16>,
    pub started_at: Instant,
    pub ended_at: Instant,
    pub peak_rms: f64,
}

impl Utterance {
    pub fn duration(&self) -> Duration {
        self.ended_at.saturating_duration_since(self.started_at)
    }
}

/// Accumulates frames for the current speech region and applies the
/// minimum-duration/peak-RMS gates when it closes.
pub struct UtteranceBuffer {
    min_duration: Duration,
    min_peak_rms: f64,
    pcm: Vec<i16>,
    started_at: Option<Instant>,
    peak_rms: f64,
    next_id: u64,
}

impl UtteranceBuffer {
    pub fn new(min_duration_ms: u64, min_peak_rms: i32) -> Self {
        Self {
            min_duration: Duration::from_millis(min_duration_ms),
            min_peak_rms: min_peak_rms as f64,
            pcm: Vec::new(),
            started_at: None,
            peak_rms: 0.0,
            next_id: 1,
        }
    }

    pub fn on_speech_start(&mut self) {
        self.pcm.clear();
        self.peak_rms = 0.0;
        self.started_at = Some(Instant::now());
    }

    pub fn push_samples(&mut self, samples: &[i16]) {
        if self.started_at.is_none() {
            // Defensive: a frame arrived without a SpeechStart preceding it.
            // The segmenter is the sole source of boundaries, so this
            // shouldn't happen in practice; drop it rather than buffer
            // audio with no region.
            return;
        }
        self.pcm.extend_from_slice(samples);
        let sum_sq: f64 = samples.iter().map(|&s| (s as f64).powi(2)).sum();
        if !samples.is_empty() {
            let rms = (sum_sq / samples.len() as f64).sqrt();
            if rms > self.peak_rms {
                self.peak_rms = rms;
            }
        }
    }

    /// Close the current region and apply the duration/RMS gates.
    /// Returns `None` if the utterance is discarded.
    pub fn on_speech_end(&mut self) -> Option<Utterance> {
        let started_at = self.started_at.take()?;
        let ended_at = Instant::now();
        let pcm = std::mem::take(&mut self.pcm);
        let peak_rms = self.peak_rms;
        self.peak_rms = 0.0;

        let duration = ended_at.saturating_duration_since(started_at);
        if duration < self.min_duration || peak_rms < self.min_peak_rms {
            return None;
        }

        let id = self.next_id;
        self.next_id += 1;
        Some(Utterance {
            id,
            pcm,
            started_at,
            ended_at,
            peak_rms,
        })
    }
}

/// Bounded handoff queue to the transcription gateway. On overflow the
/// *oldest* queued utterance is evicted and a warning is logged — the
/// inbound loop must never block on this. Backed by a `Mutex<VecDeque>`
/// plus a `Notify`, since a plain bounded `mpsc` channel has no way to drop
/// its head on overflow.
struct Shared {
    depth: usize,
    queue: Mutex<VecDeque<Utterance>>,
    notify: Notify,
    closed: std::sync::atomic::AtomicBool,
}

pub struct UtteranceQueue {
    shared: Arc<Shared>,
}

pub struct UtteranceQueueHandle {
    shared: Arc<Shared>,
}

impl UtteranceQueue {
    pub fn bounded(depth: usize) -> (Self, UtteranceQueueHandle) {
        let shared = Arc::new(Shared {
            depth: depth.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            closed: std::sync::atomic::AtomicBool::new(false),
        });
        (
            Self { shared: shared.clone() },
            UtteranceQueueHandle { shared },
        )
    }

    /// Enqueue an utterance, dropping the oldest queued one if the queue is
    /// already at depth. This never awaits — it returns immediately either
    /// way, which is the hard non-blocking constraint on the inbound loop.
    pub fn push(&self, utterance: Utterance) {
        let mut queue = self.shared.queue.lock();
        if queue.len() >= self.shared.depth {
            if let Some(dropped) = queue.pop_front() {
                warn!(
                    utterance_id = dropped.id,
                    "utterance queue full, dropping oldest queued utterance"
                );
            }
        }
        queue.push_back(utterance);
        drop(queue);
        self.shared.notify.notify_one();
    }
}

impl Drop for UtteranceQueue {
    fn drop(&mut self) {
        self.shared.closed.store(true, std::sync::atomic::Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}

impl UtteranceQueueHandle {
    /// Await the next utterance. Returns `None` once the producer side has
    /// been dropped and no utterances remain queued (mirrors `mpsc::Receiver::recv`).
    pub async fn recv(&mut self) -> Option<Utterance> {
        loop {
            if let Some(u) = self.shared.queue.lock().pop_front() {
                return Some(u);
            }
            if self.shared.closed.load(std::sync::atomic::Ordering::SeqCst) {
                return None;
            }
            self.shared.notify.notified().await;
        }
    }
}
