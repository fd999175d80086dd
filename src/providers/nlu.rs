//! HTTP intent/NLU extraction client, configured via `NLU_ENDPOINT`/`NLU_API_KEY`.
//!
//! A pure function from the dialog's point of view: (history, transcript,
//! current slots) in, slot deltas out. The provider is trusted to do its own
//! intent classification; this client only shapes the wire request/response
//! and maps transport failures onto [`AppError::NluFailure`], which the
//! dialog engine treats identically to an unintelligible transcript.

use crate::config::ProviderConfig;
use crate::dialog::slots::{SlotName, Slots};
use crate::dialog::{ConversationTurn, NluProvider, NluResult, Speaker};
use crate::error::AppError;
use crate::ratelimit::TokenBucket;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Serialize)]
struct HistoryTurn<'a> {
    speaker: &'static str,
    text: &'a str,
}

#[derive(Debug, Serialize)]
struct NluRequest<'a> {
    history: Vec<HistoryTurn<'a>>,
    transcript: &'a str,
    known_slots: &'a Slots,
}

#[derive(Debug, Deserialize)]
struct NluResponseSlot {
    slot: String,
    value: String,
}

#[derive(Debug, Deserialize, Default)]
struct NluResponse {
    #[serde(default)]
    slots: Vec<NluResponseSlot>,
}

fn parse_slot_name(name: &str) -> Option<SlotName> {
    match name {
        "service_type" => Some(SlotName::ServiceType),
        "address" => Some(SlotName::Address),
        "appointment_time" => Some(SlotName::AppointmentTime),
        "phone" => Some(SlotName::Phone),
        "name" => Some(SlotName::Name),
        _ => None,
    }
}

pub struct HttpNluProvider {
    client: Client,
    endpoint: String,
    api_key: String,
    limiter: Arc<TokenBucket>,
}

impl HttpNluProvider {
    pub fn new(cfg: &ProviderConfig, client: Client, limiter: Arc<TokenBucket>) -> Self {
        Self {
            client,
            endpoint: cfg.nlu_endpoint.clone(),
            api_key: cfg.nlu_api_key.clone(),
            limiter,
        }
    }
}

#[async_trait]
impl NluProvider for HttpNluProvider {
    async fn extract(
        &self,
        history: &[ConversationTurn],
        transcript: &str,
        slots: &Slots,
    ) -> Result<NluResult, AppError> {
        self.limiter.acquire().await;

        let body = NluRequest {
            history: history
                .iter()
                .map(|t| HistoryTurn {
                    speaker: match t.speaker {
                        Speaker::Caller => "caller",
                        Speaker::Agent => "agent",
                    },
                    text: &t.text,
                })
                .collect(),
            transcript,
            known_slots: slots,
        };

        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| AppError::NluFailure(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AppError::NluFailure(format!(
                "NLU provider returned {}",
                response.status()
            )));
        }

        let parsed: NluResponse = response
            .json()
            .await
            .map_err(|e| AppError::NluFailure(format!("malformed NLU response: {e}")))?;

        let slot_updates = parsed
            .slots
            .into_iter()
            .filter_map(|s| parse_slot_name(&s.slot).map(|name| (name, s.value)))
            .collect();

        Ok(NluResult { slot_updates })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_known_slot_names_and_drops_unknown() {
        assert_eq!(parse_slot_name("phone"), Some(SlotName::Phone));
        assert_eq!(parse_slot_name("nonsense"), None);
    }
}
