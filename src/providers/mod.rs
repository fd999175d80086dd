//! HTTP clients for the three external providers this crate treats as pure
//! functions: speech-to-text, text-to-speech, and intent/NLU extraction.
//!
//! None of these types know anything about the dialog or session layers —
//! they only implement the provider traits those layers depend on
//! ([`crate::transcription::SttProvider`], [`crate::tts::TtsProvider`],
//! [`crate::dialog::NluProvider`]), each a `reqwest` client with bearer auth
//! and a JSON body, wrapped with the shared rate limiter from
//! [`crate::ratelimit`].

pub mod nlu;
pub mod stt;
pub mod tts;

pub use nlu::HttpNluProvider;
pub use stt::HttpSttProvider;
pub use tts::{FallbackTtsProvider, HttpTtsProvider};
