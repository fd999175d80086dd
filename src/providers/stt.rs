//! HTTP speech-to-text client, configured via `STT_ENDPOINT`/`STT_API_KEY`/`STT_MODEL`.

use crate::config::ProviderConfig;
use crate::error::AppError;
use crate::ratelimit::TokenBucket;
use crate::transcription::{RawTranscript, SttProvider};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct SttRequest<'a> {
    model: &'a str,
    sample_rate: u32,
    /// Base64-encoded WAV bytes, PCM16 mono at `sample_rate`.
    audio_wav_base64: String,
}

#[derive(Debug, Deserialize)]
struct SttResponse {
    text: String,
    avg_log_prob: f32,
}

pub struct HttpSttProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
    limiter: Arc<TokenBucket>,
}

impl HttpSttProvider {
    pub fn new(cfg: &ProviderConfig, client: Client, limiter: Arc<TokenBucket>) -> Self {
        Self {
            client,
            endpoint: cfg.stt_endpoint.clone(),
            api_key: cfg.stt_api_key.clone(),
            model: cfg.stt_model.clone(),
            limiter,
        }
    }
}

/// Wrap PCM16 mono samples as an in-memory WAV file, the format most STT
/// providers expect over a plain PCM stream.
fn wrap_wav(pcm16: &[i16], sample_rate: u32) -> Result<Vec<u8>, AppError> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)
            .map_err(|e| AppError::Codec(format!("wav encode: {e}")))?;
        for &sample in pcm16 {
            writer
                .write_sample(sample)
                .map_err(|e| AppError::Codec(format!("wav encode: {e}")))?;
        }
        writer
            .finalize()
            .map_err(|e| AppError::Codec(format!("wav finalize: {e}")))?;
    }
    Ok(cursor.into_inner())
}

#[async_trait]
impl SttProvider for HttpSttProvider {
    async fn transcribe(&self, pcm16k: &[i16], sample_rate: u32) -> Result<RawTranscript, AppError> {
        self.limiter.acquire().await;

        let wav = wrap_wav(pcm16k, sample_rate)?;
        let body = SttRequest {
            model: &self.model,
            sample_rate,
            audio_wav_base64: base64::Engine::encode(&base64::engine::general_purpose::STANDARD, wav),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::SttTransient(e.to_string()))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN || status == StatusCode::BAD_REQUEST {
            return Err(AppError::SttPermanent(format!("STT provider rejected request: {status}")));
        }
        if !status.is_success() {
            return Err(AppError::SttTransient(format!("STT provider returned {status}")));
        }

        let parsed: SttResponse = response
            .json()
            .await
            .map_err(|e| AppError::SttTransient(format!("malformed STT response: {e}")))?;

        Ok(RawTranscript {
            text: parsed.text,
            avg_log_prob: parsed.avg_log_prob,
        })
    }
}
