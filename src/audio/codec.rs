//! Frame codec: telephony 8 kHz mu-law <-> 16 kHz PCM16 mono.
//!
//! Decompanding is the standard ITU-T G.711 mu-law law; resampling goes
//! through `rubato::FftFixedInOut`. Each call builds a fresh resampler rather
//! than threading filter memory across frames: the VAD segmenter downstream
//! requires every decoded frame to land on an exact sample count for its
//! configured duration (webrtc_vad only accepts a handful of fixed frame
//! sizes), and a carried-over FFT filter tail would make that length vary
//! frame to frame. The cost is a small discontinuity at each frame boundary
//! rather than one continuous filter state, which is the right tradeoff at
//! 20/30ms granularity.

use crate::audio::constants::{wire_frame_samples, PCM_SAMPLE_RATE, WIRE_SAMPLE_RATE};
use crate::audio::frame::Frame;
use crate::error::AppError;
use base64::Engine;
use rubato::{FftFixedInOut, Resampler};
use serde::{Deserialize, Serialize};

const MULAW_BIAS: i16 = 0x84;
const MULAW_CLIP: i16 = 32635;

/// Decode one mu-law byte to a linear PCM16 sample.
pub fn mulaw_decode(byte: u8) -> i16 {
    let byte = !byte;
    let sign = byte & 0x80;
    let exponent = (byte >> 4) & 0x07;
    let mantissa = byte & 0x0F;
    let mut sample = ((mantissa as i16) << 3) + MULAW_BIAS;
    sample <<= exponent;
    sample -= MULAW_BIAS;
    if sign != 0 {
        -sample
    } else {
        sample
    }
}

/// Encode one linear PCM16 sample to a mu-law byte.
pub fn mulaw_encode(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0x00 };
    let mut magnitude = if sample < 0 {
        sample.saturating_neg()
    } else {
        sample
    };
    if magnitude > MULAW_CLIP {
        magnitude = MULAW_CLIP;
    }
    magnitude += MULAW_BIAS;

    let mut exponent: u8 = 7;
    for exp in 0..8 {
        if magnitude <= (0x84 << exp) {
            exponent = exp;
            break;
        }
    }
    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    let byte = sign | (exponent << 4) | mantissa;
    !byte
}

/// Resample f32 mono PCM between arbitrary rates, chunked via `FftFixedInOut`.
fn resample_f32(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>, AppError> {
    if from_rate == to_rate || samples.is_empty() {
        return Ok(samples.to_vec());
    }

    let chunk_size = 256;
    let mut resampler = FftFixedInOut::<f32>::new(from_rate as usize, to_rate as usize, chunk_size, 1)
        .map_err(|e| AppError::Codec(format!("resampler init: {e}")))?;

    let mut output = Vec::with_capacity(
        (samples.len() as f64 * to_rate as f64 / from_rate as f64) as usize + chunk_size,
    );
    let input_frames = resampler.input_frames_next();
    let mut pos = 0;

    while pos + input_frames <= samples.len() {
        let chunk = &samples[pos..pos + input_frames];
        let result = resampler
            .process(&[chunk], None)
            .map_err(|e| AppError::Codec(format!("resample chunk: {e}")))?;
        output.extend_from_slice(&result[0]);
        pos += input_frames;
    }

    if pos < samples.len() {
        let remaining = &samples[pos..];
        let mut padded = vec![0.0f32; input_frames];
        padded[..remaining.len()].copy_from_slice(remaining);
        let result = resampler
            .process(&[&padded], None)
            .map_err(|e| AppError::Codec(format!("resample tail: {e}")))?;
        let take = (remaining.len() as f64 * to_rate as f64 / from_rate as f64) as usize;
        output.extend_from_slice(&result[0][..take.min(result[0].len())]);
    }

    Ok(output)
}

fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|&s| s as f32 / 32768.0).collect()
}

fn f32_to_i16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Inbound media frame envelope, as sent on the media WebSocket.
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum InboundEnvelope {
    Start,
    Stop,
    Media { media: MediaPayload },
}

#[derive(Debug, Deserialize)]
pub struct MediaPayload {
    pub payload: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum OutboundEnvelope<'a> {
    Media { media: OutboundMedia<'a> },
    Mark,
}

#[derive(Debug, Serialize)]
pub struct OutboundMedia<'a> {
    pub payload: &'a str,
}

/// Decodes inbound wire frames to 16 kHz PCM and encodes outbound PCM back
/// to the provider's wire format. One instance per call; holds no PCM
/// across calls to `decode`/`encode`, only the resampler's own filter state.
pub struct FrameCodec {
    frame_ms: u32,
}

impl FrameCodec {
    pub fn new(frame_ms: u32) -> Self {
        Self { frame_ms }
    }

    /// Parse and decode one inbound JSON envelope. Returns `Ok(None)` for
    /// non-audio envelopes (start/stop), `Err(FrameMalformed)` for anything
    /// that doesn't parse, and never panics on malformed input.
    pub fn decode_inbound(&self, raw: &str) -> Result<Option<Frame>, AppError> {
        let envelope: InboundEnvelope = serde_json::from_str(raw)
            .map_err(|e| AppError::FrameMalformed(e.to_string()))?;

        let media = match envelope {
            InboundEnvelope::Media { media } => media,
            InboundEnvelope::Start | InboundEnvelope::Stop => return Ok(None),
        };

        let wire_bytes = base64::engine::general_purpose::STANDARD
            .decode(media.payload.as_bytes())
            .map_err(|e| AppError::FrameMalformed(format!("bad base64 payload: {e}")))?;

        if wire_bytes.is_empty() {
            return Err(AppError::FrameMalformed("empty media payload".into()));
        }

        let wire_pcm: Vec<i16> = wire_bytes.iter().map(|&b| mulaw_decode(b)).collect();
        let wire_f32 = i16_to_f32(&wire_pcm);
        let pcm16k_f32 = resample_f32(&wire_f32, WIRE_SAMPLE_RATE, PCM_SAMPLE_RATE)?;
        let pcm16k = f32_to_i16(&pcm16k_f32);

        Ok(Some(Frame::new(pcm16k)))
    }

    /// Encode outbound 16 kHz PCM into wire-rate mu-law frames, chunked to
    /// `frame_ms` each, ready to be base64-wrapped by the caller one frame
    /// at a time (so the TTS scheduler can pace real-time playback).
    pub fn encode_outbound_chunks(&self, pcm16k: &[i16]) -> Result<Vec<Vec<u8>>, AppError> {
        let pcm_f32 = i16_to_f32(pcm16k);
        let wire_f32 = resample_f32(&pcm_f32, PCM_SAMPLE_RATE, WIRE_SAMPLE_RATE)?;
        let wire_pcm = f32_to_i16(&wire_f32);
        let mulaw: Vec<u8> = wire_pcm.iter().map(|&s| mulaw_encode(s)).collect();

        let chunk_len = wire_frame_samples(self.frame_ms);
        Ok(mulaw.chunks(chunk_len.max(1)).map(|c| c.to_vec()).collect())
    }

    /// Wrap one mu-law chunk as the provider's outbound JSON envelope.
    pub fn wrap_outbound(chunk: &[u8]) -> String {
        let b64 = base64::engine::general_purpose::STANDARD.encode(chunk);
        let envelope = OutboundEnvelope::Media {
            media: OutboundMedia { payload: &b64 },
        };
        serde_json::to_string(&envelope).expect("envelope serialization is infallible")
    }

    /// The provider "mark" envelope, used for outbound playback
    /// synchronization.
    pub fn mark_envelope() -> String {
        serde_json::to_string(&OutboundEnvelope::Mark).expect("infallible")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mulaw_round_trip_is_lossy_but_close() {
        for sample in [-20000i16, -1000, 0, 1000, 20000] {
            let encoded = mulaw_encode(sample);
            let decoded = mulaw_decode(encoded);
            assert!(
                (decoded as i32 - sample as i32).abs() < 1000,
                "sample {sample} round-tripped to {decoded}, too lossy"
            );
        }
    }

    #[test]
    fn mulaw_silence_round_trips_to_near_zero() {
        let encoded = mulaw_encode(0);
        let decoded = mulaw_decode(encoded);
        assert!(decoded.abs() < 50);
    }

    #[test]
    fn decode_inbound_rejects_garbage_json() {
        let codec = FrameCodec::new(30);
        let err = codec.decode_inbound("{not json").unwrap_err();
        assert!(matches!(err, AppError::FrameMalformed(_)));
    }

    #[test]
    fn decode_inbound_ignores_start_stop_events() {
        let codec = FrameCodec::new(30);
        assert!(codec.decode_inbound(r#"{"event":"start"}"#).unwrap().is_none());
        assert!(codec.decode_inbound(r#"{"event":"stop"}"#).unwrap().is_none());
    }

    #[test]
    fn decode_inbound_produces_16k_frame_from_8k_payload() {
        let codec = FrameCodec::new(20);
        let wire_samples = wire_frame_samples(20); // 160 samples at 8kHz
        let mulaw: Vec<u8> = (0..wire_samples).map(|_| mulaw_encode(5000)).collect();
        let b64 = base64::engine::general_purpose::STANDARD.encode(&mulaw);
        let raw = serde_json::json!({"event": "media", "media": {"payload": b64}}).to_string();

        let frame = codec.decode_inbound(&raw).unwrap().expect("should decode a frame");
        // 8kHz -> 16kHz doubles the sample count (allow FFT chunking slack).
        assert!(frame.samples.len() > 0);
    }

    #[test]
    fn encode_outbound_chunks_splits_into_frame_sized_pieces() {
        let codec = FrameCodec::new(20);
        let pcm: Vec<i16> = vec![1000; PCM_SAMPLE_RATE as usize]; // 1 second
        let chunks = codec.encode_outbound_chunks(&pcm).unwrap();
        assert!(!chunks.is_empty());
        let expected_chunk_len = wire_frame_samples(20);
        for chunk in &chunks[..chunks.len() - 1] {
            assert_eq!(chunk.len(), expected_chunk_len);
        }
    }

    #[test]
    fn wrap_outbound_produces_media_event() {
        let json = FrameCodec::wrap_outbound(&[1, 2, 3]);
        assert!(json.contains("\"event\":\"media\""));
    }
}
