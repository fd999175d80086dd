//! Environment-driven configuration.
//!
//! Every tunable is read once at startup via [`Config::from_env`]. Missing
//! *required* values (the provider credentials) are a `ConfigMissing` error,
//! which `main` turns into exit code 2; everything else falls back to a
//! sensible default.

use crate::error::AppError;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub stt_endpoint: String,
    pub stt_api_key: String,
    pub stt_model: String,
    pub tts_endpoint: String,
    pub tts_api_key: String,
    pub tts_voice_id: String,
    /// Fallback TTS endpoint/key, tried once if the primary voice fails.
    /// Defaults to the primary pair when not set separately, so a single
    /// TTS account still gets one retry rather than dropping straight to
    /// the pre-recorded clip.
    pub tts_fallback_endpoint: String,
    pub tts_fallback_api_key: String,
    pub nlu_endpoint: String,
    pub nlu_api_key: String,
}

#[derive(Debug, Clone)]
pub struct VadConfig {
    pub aggressiveness: u8,
    pub frame_ms: u32,
    pub silence_timeout: Duration,
    pub min_speech: Duration,
    pub preroll_ignore: Duration,
    pub min_start_rms: i32,
}

#[derive(Debug, Clone)]
pub struct TranscriptionConfig {
    pub confidence_threshold: f32,
    pub min_utterance_ms: u64,
    pub min_utterance_rms: i32,
    pub request_timeout: Duration,
    pub consecutive_failure_streak: u32,
}

#[derive(Debug, Clone)]
pub struct TimeoutConfig {
    pub call_max: Duration,
    pub caller_silence: Duration,
    pub operator_timeout: Duration,
    pub drain_window: Duration,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub providers: ProviderConfig,
    pub vad: VadConfig,
    pub transcription: TranscriptionConfig,
    pub timeouts: TimeoutConfig,
    pub utterance_queue_depth: usize,
    pub provider_qps: u32,
}

fn env_var(name: &str) -> Result<String, AppError> {
    std::env::var(name).map_err(|_| AppError::ConfigMissing(name.to_string()))
}

fn env_opt(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let providers = ProviderConfig {
            stt_endpoint: env_var("STT_ENDPOINT")?,
            stt_api_key: env_var("STT_API_KEY")?,
            stt_model: env_opt("STT_MODEL", "default"),
            tts_endpoint: env_var("TTS_ENDPOINT")?,
            tts_api_key: env_var("TTS_API_KEY")?,
            tts_voice_id: env_opt("TTS_VOICE_ID", "default"),
            tts_fallback_endpoint: std::env::var("TTS_FALLBACK_ENDPOINT")
                .unwrap_or_else(|_| std::env::var("TTS_ENDPOINT").unwrap_or_default()),
            tts_fallback_api_key: std::env::var("TTS_FALLBACK_API_KEY")
                .unwrap_or_else(|_| std::env::var("TTS_API_KEY").unwrap_or_default()),
            nlu_endpoint: env_var("NLU_ENDPOINT")?,
            nlu_api_key: env_var("NLU_API_KEY")?,
        };

        let frame_ms: u32 = env_parse("VAD_FRAME_MS", 30);
        if frame_ms != 20 && frame_ms != 30 {
            return Err(AppError::ConfigMissing(format!(
                "VAD_FRAME_MS must be 20 or 30, got {frame_ms}"
            )));
        }
        let aggressiveness: u8 = env_parse("VAD_AGGRESSIVENESS", 2);
        if aggressiveness > 3 {
            return Err(AppError::ConfigMissing(format!(
                "VAD_AGGRESSIVENESS must be 0-3, got {aggressiveness}"
            )));
        }

        let vad = VadConfig {
            aggressiveness,
            frame_ms,
            silence_timeout: Duration::from_secs_f64(env_parse("SILENCE_TIMEOUT_SEC", 2.0)),
            min_speech: Duration::from_secs_f64(env_parse("MIN_SPEECH_SEC", 0.5)),
            preroll_ignore: Duration::from_secs_f64(env_parse("PREROLL_IGNORE_SEC", 0.5)),
            min_start_rms: env_parse("MIN_START_RMS", 100),
        };

        let transcription = TranscriptionConfig {
            confidence_threshold: env_parse("STT_CONF_THRESHOLD", -0.7),
            min_utterance_ms: env_parse("MIN_UTTERANCE_MS", 500),
            min_utterance_rms: env_parse("MIN_UTTERANCE_RMS", 60),
            request_timeout: Duration::from_secs(8),
            consecutive_failure_streak: 5,
        };

        let timeouts = TimeoutConfig {
            call_max: Duration::from_secs(env_parse("CALL_MAX_SEC", 900)),
            caller_silence: Duration::from_secs(env_parse("CALLER_SILENCE_SEC", 30)),
            operator_timeout: Duration::from_secs(env_parse("OPERATOR_TIMEOUT_SEC", 600)),
            drain_window: Duration::from_secs(2),
        };

        Ok(Self {
            http_port: env_parse("HTTP_PORT", 8080),
            log_level: env_opt("LOG_LEVEL", "info"),
            providers,
            vad,
            transcription,
            timeouts,
            utterance_queue_depth: 4,
            provider_qps: env_parse("PROVIDER_QPS", 10),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_required_env() {
        for (k, v) in [
            ("STT_ENDPOINT", "https://stt.example/v1"),
            ("STT_API_KEY", "k"),
            ("TTS_ENDPOINT", "https://tts.example/v1"),
            ("TTS_API_KEY", "k"),
            ("NLU_ENDPOINT", "https://nlu.example/v1"),
            ("NLU_API_KEY", "k"),
        ] {
            std::env::set_var(k, v);
        }
    }

    #[test]
    fn defaults_match_documented_values() {
        set_required_env();
        std::env::remove_var("VAD_AGGRESSIVENESS");
        std::env::remove_var("VAD_FRAME_MS");
        let cfg = Config::from_env().expect("config should load with required vars set");
        assert_eq!(cfg.vad.aggressiveness, 2);
        assert_eq!(cfg.vad.frame_ms, 30);
        assert_eq!(cfg.vad.silence_timeout, Duration::from_secs_f64(2.0));
        assert_eq!(cfg.vad.min_speech, Duration::from_secs_f64(0.5));
        assert_eq!(cfg.vad.min_start_rms, 100);
        assert_eq!(cfg.transcription.min_utterance_ms, 500);
        assert_eq!(cfg.transcription.min_utterance_rms, 60);
        assert_eq!(cfg.timeouts.call_max, Duration::from_secs(900));
        assert_eq!(cfg.timeouts.caller_silence, Duration::from_secs(30));
        assert_eq!(cfg.timeouts.operator_timeout, Duration::from_secs(600));
    }

    #[test]
    fn missing_required_var_is_config_missing() {
        set_required_env();
        std::env::remove_var("STT_ENDPOINT");
        let err = Config::from_env().expect_err("missing STT_ENDPOINT should error");
        assert!(matches!(err, AppError::ConfigMissing(_)));
        std::env::set_var("STT_ENDPOINT", "https://stt.example/v1");
    }

    #[test]
    fn rejects_bad_frame_ms() {
        set_required_env();
        std::env::set_var("VAD_FRAME_MS", "25");
        let err = Config::from_env().expect_err("25ms frames are not allowed");
        assert!(matches!(err, AppError::ConfigMissing(_)));
        std::env::remove_var("VAD_FRAME_MS");
    }
}
