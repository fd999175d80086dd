//! HTTP text-to-speech client, configured via `TTS_ENDPOINT`/`TTS_API_KEY`/`TTS_VOICE_ID`.

use crate::audio::constants::PCM_SAMPLE_RATE;
use crate::config::ProviderConfig;
use crate::error::AppError;
use crate::ratelimit::TokenBucket;
use crate::tts::TtsProvider;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct TtsRequest<'a> {
    text: &'a str,
    voice_id: &'a str,
    sample_rate: u32,
}

#[derive(Debug, Deserialize)]
struct TtsResponse {
    /// Base64-encoded WAV bytes, PCM16 mono at the requested sample rate.
    audio_wav_base64: String,
}

pub struct HttpTtsProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    limiter: Arc<TokenBucket>,
}

impl HttpTtsProvider {
    pub fn new(cfg: &ProviderConfig, client: Client, limiter: Arc<TokenBucket>) -> Self {
        Self {
            client,
            endpoint: cfg.tts_endpoint.clone(),
            api_key: cfg.tts_api_key.clone(),
            limiter,
        }
    }
}

fn unwrap_wav(bytes: &[u8]) -> Result<Vec<i16>, AppError> {
    let mut reader =
        hound::WavReader::new(Cursor::new(bytes)).map_err(|e| AppError::Codec(format!("wav decode: {e}")))?;
    reader
        .samples::<i16>()
        .collect::<Result<Vec<i16>, _>>()
        .map_err(|e| AppError::Codec(format!("wav sample decode: {e}")))
}

#[async_trait]
impl TtsProvider for HttpTtsProvider {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<i16>, AppError> {
        self.limiter.acquire().await;

        let body = TtsRequest {
            text,
            voice_id,
            sample_rate: PCM_SAMPLE_RATE,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::TtsFailure(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::TtsFailure(format!("TTS provider returned {status}")));
        }

        let parsed: TtsResponse = response
            .json()
            .await
            .map_err(|e| AppError::TtsFailure(format!("malformed TTS response: {e}")))?;

        let wav = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, parsed.audio_wav_base64)
            .map_err(|e| AppError::TtsFailure(format!("bad base64 audio: {e}")))?;

        unwrap_wav(&wav).map_err(|e| AppError::TtsFailure(e.to_string()))
    }
}

/// Wraps a primary and a fallback client behind one `TtsProvider`: on
/// synthesis failure, retries once against the fallback endpoint before
/// giving up. Shares the request/response shape with [`HttpTtsProvider`] —
/// providers speaking this wire contract are interchangeable by
/// construction.
pub struct FallbackTtsProvider {
    primary: HttpTtsProvider,
    fallback: HttpTtsProvider,
}

impl FallbackTtsProvider {
    pub fn new(primary: HttpTtsProvider, fallback: HttpTtsProvider) -> Self {
        Self { primary, fallback }
    }
}

#[async_trait]
impl TtsProvider for FallbackTtsProvider {
    async fn synthesize(&self, text: &str, voice_id: &str) -> Result<Vec<i16>, AppError> {
        match self.primary.synthesize(text, voice_id).await {
            Ok(pcm) => Ok(pcm),
            Err(primary_err) => {
                tracing::warn!(error = %primary_err, "primary TTS failed, trying fallback voice");
                self.fallback.synthesize(text, voice_id).await
            }
        }
    }
}
