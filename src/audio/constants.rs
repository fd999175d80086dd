//! Audio constants — single source of truth for sample rates and framing.
//!
//! Wire format is always the provider's 8 kHz companded mono; the internal
//! pipeline (VAD, STT, TTS) is always 16 kHz. [`crate::audio::codec`] is the
//! only place that crosses between the two.

/// Provider wire sample rate (8 kHz telephony).
pub const WIRE_SAMPLE_RATE: u32 = 8_000;

/// Internal pipeline sample rate (VAD/STT/TTS all operate on this).
pub const PCM_SAMPLE_RATE: u32 = 16_000;

/// Wire-side samples (8 kHz) for the same frame duration, prior to resampling.
pub fn wire_frame_samples(frame_ms: u32) -> usize {
    (WIRE_SAMPLE_RATE as u64 * frame_ms as u64 / 1000) as usize
}
