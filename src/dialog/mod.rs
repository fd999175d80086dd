//! Dialog state machine: turns transcripts and operator verdicts into agent
//! turns.
//!
//! A single reducer over one tagged `DialogState`, not a scatter of boolean
//! flags: every external signal (accepted transcript, unintelligible input,
//! operator verdict, forced closing) goes through one of the handful of
//! methods below and comes back as a [`DialogStep`] describing exactly what
//! the session should do next.

pub mod slots;

use crate::error::AppError;
use crate::transcription::Transcript;
use async_trait::async_trait;
use slots::{SlotName, Slots};
use std::sync::Arc;

/// Caller/agent turn ordering as it became visible to the dialog, not
/// wall-clock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Speaker {
    Caller,
    Agent,
}

#[derive(Debug, Clone)]
pub struct ConversationTurn {
    pub speaker: Speaker,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentIntent {
    Prompt,
    Confirm,
    Farewell,
}

/// One turn the dialog wants spoken. `terminal` signals the session should
/// close the call once this turn finishes playing (or is cancelled).
#[derive(Debug, Clone)]
pub struct AgentTurn {
    pub text: String,
    pub intent: AgentIntent,
    pub interruptible: bool,
    pub terminal: bool,
}

impl AgentTurn {
    fn prompt(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            intent: AgentIntent::Prompt,
            interruptible: true,
            terminal: false,
        }
    }

    fn confirm(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            intent: AgentIntent::Confirm,
            interruptible: true,
            terminal: false,
        }
    }

    fn terminal_confirm(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            intent: AgentIntent::Confirm,
            interruptible: false,
            terminal: true,
        }
    }

    fn farewell_preamble(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            intent: AgentIntent::Farewell,
            interruptible: true,
            terminal: false,
        }
    }

    fn farewell_final(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            intent: AgentIntent::Farewell,
            interruptible: false,
            terminal: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DialogState {
    Greeting,
    Collecting,
    ConfirmingTime,
    AwaitingOperator,
    Farewell,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BookingStatus {
    Collecting,
    AwaitingOperator,
    Approved,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct BookingDraft {
    pub status: BookingStatus,
    pub slots: Slots,
}

impl BookingDraft {
    fn new() -> Self {
        Self {
            status: BookingStatus::Collecting,
            slots: Slots::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorVerdict {
    Approve,
    Reject,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosingReason {
    InactivityExceeded,
    CallMaxExceeded,
    RepromptExhausted,
    /// The STT provider rejected the request outright (auth/4xx). Not
    /// recoverable mid-call, so the caller gets an apology
    /// and the call ends, but the process itself keeps running.
    SttProviderFailure,
}

/// Slot deltas and a booking-intent signal, extracted by the external NLU
/// system from (history, transcript, current slots). A pure function from
/// the dialog's point of view — no state, no side effects.
#[derive(Debug, Clone, Default)]
pub struct NluResult {
    pub slot_updates: Vec<(SlotName, String)>,
}

#[async_trait]
pub trait NluProvider: Send + Sync {
    async fn extract(
        &self,
        history: &[ConversationTurn],
        transcript: &str,
        slots: &Slots,
    ) -> Result<NluResult, AppError>;
}

/// Words that, when matched as whole words case-insensitively against a
/// transcript during confirmation, signal the caller is answering yes/no.
/// Kept as plain lexicons rather than a classifier — confirmation answers
/// are short and formulaic enough not to need the NLU round trip.
const AFFIRMATIVE_LEXICON: &[&str] = &[
    "yes", "yeah", "yep", "yup", "correct", "confirm", "confirmed", "right", "sounds good",
    "that's right", "that's correct",
];
const NEGATIVE_LEXICON: &[&str] = &[
    "no", "nope", "wrong", "incorrect", "not right", "not correct", "actually", "change",
];

fn matches_lexicon(text: &str, lexicon: &[&str]) -> bool {
    let lower = text.to_lowercase();
    lexicon.iter().any(|phrase| lower.contains(phrase))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Confirmation {
    Affirmative,
    Negative,
    Neutral,
}

fn classify_confirmation(text: &str) -> Confirmation {
    let negative = matches_lexicon(text, NEGATIVE_LEXICON);
    let affirmative = matches_lexicon(text, AFFIRMATIVE_LEXICON);
    // Tie-break: a correction/negative cue present alongside an affirmative
    // one is treated as a correction, so check negative first.
    if negative {
        Confirmation::Negative
    } else if affirmative {
        Confirmation::Affirmative
    } else {
        Confirmation::Neutral
    }
}

/// Everything the session needs to act on after one dialog transition.
#[derive(Debug, Clone, Default)]
pub struct DialogStep {
    pub turns: Vec<AgentTurn>,
    pub booking_pending: Option<BookingDraft>,
    pub booking_confirmed: Option<BookingDraft>,
    pub booking_rejected: Option<BookingDraft>,
    pub request_hangup: bool,
}

impl DialogStep {
    fn turn(turn: AgentTurn) -> Self {
        Self {
            turns: vec![turn],
            ..Default::default()
        }
    }

    fn turns(turns: Vec<AgentTurn>) -> Self {
        Self {
            turns,
            ..Default::default()
        }
    }
}

const MAX_REPROMPTS: u8 = 3;
/// Consecutive unintelligible inputs before a reprompt is issued.
const REPROMPT_STREAK_THRESHOLD: u8 = 2;

/// One call's dialog state. Not `Send`-constrained on its own; the session
/// owns exactly one per call and drives it serially.
pub struct DialogEngine {
    nlu: Arc<dyn NluProvider>,
    state: DialogState,
    history: Vec<ConversationTurn>,
    draft: BookingDraft,
    unintelligible_streak: u8,
    reprompt_count: u8,
}

impl DialogEngine {
    pub fn new(nlu: Arc<dyn NluProvider>) -> Self {
        Self {
            nlu,
            state: DialogState::Greeting,
            history: Vec::new(),
            draft: BookingDraft::new(),
            unintelligible_streak: 0,
            reprompt_count: 0,
        }
    }

    pub fn state(&self) -> DialogState {
        self.state
    }

    pub fn draft(&self) -> &BookingDraft {
        &self.draft
    }

    pub fn history(&self) -> &[ConversationTurn] {
        &self.history
    }

    fn push_agent_turns(&mut self, turns: &[AgentTurn]) {
        for turn in turns {
            self.history.push(ConversationTurn {
                speaker: Speaker::Agent,
                text: turn.text.clone(),
            });
        }
    }

    /// Produce the opening greeting. Transitions to `Collecting` immediately
    /// once the turn is handed back — the move doesn't wait for playback to
    /// finish, so a caller who barges in during the greeting is already
    /// talking to `Collecting`.
    pub fn start(&mut self) -> AgentTurn {
        let turn = AgentTurn::prompt(
            "Thanks for calling! I can help you book an appointment. What service would you like?",
        );
        self.push_agent_turns(std::slice::from_ref(&turn));
        self.state = DialogState::Collecting;
        turn
    }

    /// An accepted transcript reached the dialog layer. Resets the
    /// unintelligible streak — whatever this says, it was intelligible.
    pub async fn on_transcript(&mut self, transcript: &Transcript) -> DialogStep {
        self.unintelligible_streak = 0;
        self.history.push(ConversationTurn {
            speaker: Speaker::Caller,
            text: transcript.text.clone(),
        });

        match self.state {
            DialogState::Greeting => {
                // Shouldn't normally happen: Greeting -> Collecting happens
                // synchronously in `start`. Handle defensively as Collecting.
                self.state = DialogState::Collecting;
                self.handle_collecting(&transcript.text).await
            }
            DialogState::Collecting => self.handle_collecting(&transcript.text).await,
            DialogState::ConfirmingTime => self.handle_confirming(&transcript.text).await,
            DialogState::AwaitingOperator | DialogState::Farewell | DialogState::Aborted => {
                // Dialog has moved past caller input; nothing to do.
                DialogStep::default()
            }
        }
    }

    async fn handle_collecting(&mut self, text: &str) -> DialogStep {
        match self.nlu.extract(&self.history, text, &self.draft.slots).await {
            Ok(result) => {
                for (slot, value) in result.slot_updates {
                    self.draft.slots.set(slot, value);
                }
            }
            Err(_) => return self.register_unintelligible(),
        }

        self.advance_after_slot_update()
    }

    fn advance_after_slot_update(&mut self) -> DialogStep {
        if let Some(missing) = self.draft.slots.next_missing() {
            let turn = AgentTurn::prompt(missing.prompt());
            self.push_agent_turns(std::slice::from_ref(&turn));
            DialogStep::turn(turn)
        } else {
            self.state = DialogState::ConfirmingTime;
            let turn = AgentTurn::confirm(format!(
                "I have {}. Is that correct?",
                self.draft.slots.summary()
            ));
            self.push_agent_turns(std::slice::from_ref(&turn));
            DialogStep::turn(turn)
        }
    }

    async fn handle_confirming(&mut self, text: &str) -> DialogStep {
        // Always run extraction too, so an explicit correction ("no, make it
        // 3pm instead") is caught even when the lexicon match alone can't
        // tell which slot is contested.
        let nlu_result = self.nlu.extract(&self.history, text, &self.draft.slots).await;
        let mut corrected_slot: Option<SlotName> = None;
        if let Ok(result) = &nlu_result {
            for (slot, value) in &result.slot_updates {
                if self.draft.slots.get(*slot) != Some(value.as_str()) {
                    corrected_slot = Some(*slot);
                }
            }
        }

        let confirmation = classify_confirmation(text);
        let has_correction = corrected_slot.is_some() || confirmation == Confirmation::Negative;

        if has_correction {
            if let Ok(result) = nlu_result {
                for (slot, value) in result.slot_updates {
                    self.draft.slots.set(slot, value);
                }
            }
            if corrected_slot.is_none() {
                // Negative with no identifiable correction target: the
                // appointment time is the field callers most often revise
                // in this flow, so that's the one we reopen.
                self.draft.slots.clear(SlotName::AppointmentTime);
            }
            self.state = DialogState::Collecting;
            return self.advance_after_slot_update();
        }

        match confirmation {
            Confirmation::Affirmative => {
                self.draft.status = BookingStatus::AwaitingOperator;
                self.state = DialogState::AwaitingOperator;
                let turn = AgentTurn::terminal_confirm(
                    "You'll be sent an SMS with your booking details once your appointment is confirmed. Thanks for calling, have a great rest of your day.",
                );
                self.push_agent_turns(std::slice::from_ref(&turn));
                let mut step = DialogStep::turn(turn);
                step.booking_pending = Some(self.draft.clone());
                step
            }
            Confirmation::Negative => unreachable!("handled by has_correction above"),
            Confirmation::Neutral => self.register_unintelligible(),
        }
    }

    /// Called by the session once per caller-silence window that didn't yet
    /// reach the termination threshold. Distinct from
    /// `register_unintelligible`'s streak counter — a quiet caller who's
    /// still on the line isn't the same as one the STT/NLU pipeline can't
    /// understand, so this doesn't touch `unintelligible_streak` or
    /// `reprompt_count`.
    pub fn on_inactivity(&mut self) -> DialogStep {
        match self.state {
            DialogState::Collecting | DialogState::ConfirmingTime => {
                let turn = AgentTurn::prompt("Are you still there?");
                self.push_agent_turns(std::slice::from_ref(&turn));
                DialogStep::turn(turn)
            }
            DialogState::Greeting | DialogState::AwaitingOperator | DialogState::Farewell | DialogState::Aborted => {
                DialogStep::default()
            }
        }
    }

    /// Called by the session whenever the transcription gateway rejects an
    /// utterance (low confidence) or the provider errors — both treated as
    /// unintelligible input for dialog purposes (an NLU failure routes here
    /// too).
    pub fn register_unintelligible(&mut self) -> DialogStep {
        self.unintelligible_streak += 1;
        if self.unintelligible_streak < REPROMPT_STREAK_THRESHOLD {
            return DialogStep::default();
        }
        self.unintelligible_streak = 0;
        self.reprompt_count += 1;

        if self.reprompt_count > MAX_REPROMPTS {
            return self.close(ClosingReason::RepromptExhausted);
        }

        self.state = DialogState::Collecting;
        let turn = AgentTurn::prompt("Sorry, I didn't catch that. Could you say that again?");
        self.push_agent_turns(std::slice::from_ref(&turn));
        DialogStep::turn(turn)
    }

    /// Operator approved, rejected, or never responded within the timeout.
    /// May be invoked after the caller has already hung up — in that case
    /// `turns` will be empty and only the booking transition matters.
    pub fn on_operator_verdict(&mut self, verdict: OperatorVerdict) -> DialogStep {
        if self.state != DialogState::AwaitingOperator {
            return DialogStep::default();
        }

        match verdict {
            OperatorVerdict::Approve => {
                self.draft.status = BookingStatus::Approved;
                self.state = DialogState::Farewell;
                let mut step = DialogStep::default();
                step.booking_confirmed = Some(self.draft.clone());
                step
            }
            OperatorVerdict::Reject | OperatorVerdict::Timeout => {
                self.draft.status = BookingStatus::Rejected;
                self.state = DialogState::Aborted;
                let mut step = DialogStep::default();
                step.booking_rejected = Some(self.draft.clone());
                step
            }
        }
    }

    /// Session-driven forced closing: inactivity, call-max duration, or
    /// reprompt exhaustion. Produces the two-part farewell turn (interruptible
    /// preamble, non-interruptible terminal sentence).
    pub fn close(&mut self, reason: ClosingReason) -> DialogStep {
        self.state = DialogState::Aborted;

        let preamble = match reason {
            ClosingReason::RepromptExhausted => {
                "I'm having trouble understanding. Let me transfer you to someone who can help."
            }
            ClosingReason::InactivityExceeded => "I haven't heard from you in a while.",
            ClosingReason::CallMaxExceeded => "We're coming up on the end of our time together.",
            ClosingReason::SttProviderFailure => {
                "I'm sorry, I'm having trouble with our speech system right now."
            }
        };
        let preamble_turn = AgentTurn::farewell_preamble(preamble);
        let final_turn = AgentTurn::farewell_final("Thanks for calling, goodbye.");
        self.push_agent_turns(&[preamble_turn.clone(), final_turn.clone()]);

        let mut step = DialogStep::turns(vec![preamble_turn, final_turn]);
        step.request_hangup = true;
        step
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct ScriptedNlu {
        responses: Mutex<Vec<Result<NluResult, AppError>>>,
    }

    #[async_trait]
    impl NluProvider for ScriptedNlu {
        async fn extract(
            &self,
            _history: &[ConversationTurn],
            _transcript: &str,
            _slots: &Slots,
        ) -> Result<NluResult, AppError> {
            self.responses.lock().unwrap().remove(0)
        }
    }

    fn nlu_with(responses: Vec<Result<NluResult, AppError>>) -> Arc<dyn NluProvider> {
        Arc::new(ScriptedNlu {
            responses: Mutex::new(responses),
        })
    }

    fn transcript(text: &str) -> Transcript {
        Transcript {
            text: text.to_string(),
            avg_log_prob: -0.1,
            utterance_id: 1,
        }
    }

    #[tokio::test]
    async fn greeting_moves_to_collecting_immediately() {
        let mut engine = DialogEngine::new(nlu_with(vec![]));
        assert_eq!(engine.state(), DialogState::Greeting);
        engine.start();
        assert_eq!(engine.state(), DialogState::Collecting);
    }

    #[tokio::test]
    async fn collects_all_slots_then_moves_to_confirming() {
        let responses = vec![
            Ok(NluResult {
                slot_updates: vec![(SlotName::ServiceType, "haircut".into())],
            }),
            Ok(NluResult {
                slot_updates: vec![(SlotName::Address, "123 Main St".into())],
            }),
            Ok(NluResult {
                slot_updates: vec![(SlotName::AppointmentTime, "tomorrow at 2pm".into())],
            }),
            Ok(NluResult {
                slot_updates: vec![(SlotName::Phone, "555-0100".into())],
            }),
            Ok(NluResult {
                slot_updates: vec![(SlotName::Name, "Alex".into())],
            }),
        ];
        let mut engine = DialogEngine::new(nlu_with(responses));
        engine.start();

        for text in ["haircut", "123 Main St", "tomorrow at 2pm", "555-0100", "Alex"] {
            let step = engine.on_transcript(&transcript(text)).await;
            assert_eq!(step.turns.len(), 1);
        }

        assert_eq!(engine.state(), DialogState::ConfirmingTime);
        assert!(engine.draft().slots.is_complete());
    }

    #[tokio::test]
    async fn affirmative_confirmation_moves_to_awaiting_operator_and_marks_pending() {
        let mut engine = DialogEngine::new(nlu_with(vec![Ok(NluResult::default())]));
        engine.start();
        // force into ConfirmingTime directly for this test
        for (slot, value) in slots::SLOT_PRIORITY.iter().zip(["a", "b", "c", "d", "e"]) {
            engine.draft.slots.set(*slot, value.into());
        }
        engine.state = DialogState::ConfirmingTime;

        let step = engine.on_transcript(&transcript("yes that's correct")).await;
        assert_eq!(engine.state(), DialogState::AwaitingOperator);
        assert!(step.booking_pending.is_some());
        assert!(step.turns[0].terminal);
        assert!(!step.turns[0].interruptible);
    }

    #[tokio::test]
    async fn correction_beats_affirmative_when_both_present() {
        let mut engine = DialogEngine::new(nlu_with(vec![Ok(NluResult {
            slot_updates: vec![(SlotName::AppointmentTime, "3pm".into())],
        })]));
        engine.start();
        for (slot, value) in slots::SLOT_PRIORITY.iter().zip(["a", "b", "c", "d", "2pm"]) {
            engine.draft.slots.set(*slot, value.into());
        }
        engine.draft.slots.set(SlotName::AppointmentTime, "2pm".into());
        engine.state = DialogState::ConfirmingTime;

        // "yes, but actually make it 3pm" contains both an affirmative and a
        // correction cue; correction must win.
        let step = engine.on_transcript(&transcript("yes but actually 3pm")).await;
        assert_eq!(engine.state(), DialogState::Collecting);
        assert_eq!(engine.draft().slots.appointment_time.as_deref(), Some("3pm"));
        assert!(step.booking_pending.is_none());
    }

    #[tokio::test]
    async fn inactivity_reprompts_while_collecting_without_touching_unintelligible_streak() {
        let mut engine = DialogEngine::new(nlu_with(vec![]));
        engine.start();
        let step = engine.on_inactivity();
        assert_eq!(step.turns.len(), 1);
        assert_eq!(engine.state(), DialogState::Collecting);
        // Two more inactivity windows shouldn't push the engine toward the
        // unintelligible-streak reprompt/transfer path.
        engine.on_inactivity();
        let step = engine.on_inactivity();
        assert_eq!(step.turns.len(), 1);
        assert_eq!(engine.reprompt_count, 0);
    }

    #[tokio::test]
    async fn inactivity_is_a_noop_once_awaiting_operator() {
        let mut engine = DialogEngine::new(nlu_with(vec![]));
        engine.start();
        engine.state = DialogState::AwaitingOperator;
        let step = engine.on_inactivity();
        assert!(step.turns.is_empty());
    }

    #[tokio::test]
    async fn reprompt_fires_after_two_consecutive_unintelligible_inputs() {
        let mut engine = DialogEngine::new(nlu_with(vec![]));
        engine.start();
        assert!(engine.register_unintelligible().turns.is_empty());
        let step = engine.register_unintelligible();
        assert_eq!(step.turns.len(), 1);
        assert_eq!(engine.state(), DialogState::Collecting);
    }

    #[tokio::test]
    async fn reprompt_exhaustion_ends_the_call() {
        let mut engine = DialogEngine::new(nlu_with(vec![]));
        engine.start();
        let mut last_step = DialogStep::default();
        for _ in 0..(MAX_REPROMPTS + 1) {
            engine.register_unintelligible();
            last_step = engine.register_unintelligible();
        }
        assert_eq!(engine.state(), DialogState::Aborted);
        assert!(last_step.request_hangup);
        assert_eq!(last_step.turns.len(), 2);
        assert!(last_step.turns[0].interruptible);
        assert!(!last_step.turns[1].interruptible);
    }

    #[tokio::test]
    async fn operator_approve_confirms_booking() {
        let mut engine = DialogEngine::new(nlu_with(vec![]));
        engine.start();
        engine.state = DialogState::AwaitingOperator;
        let step = engine.on_operator_verdict(OperatorVerdict::Approve);
        assert_eq!(engine.state(), DialogState::Farewell);
        assert!(step.booking_confirmed.is_some());
        assert!(step.turns.is_empty(), "approval after hangup must not produce audio");
    }

    #[tokio::test]
    async fn operator_reject_aborts_booking() {
        let mut engine = DialogEngine::new(nlu_with(vec![]));
        engine.start();
        engine.state = DialogState::AwaitingOperator;
        let step = engine.on_operator_verdict(OperatorVerdict::Reject);
        assert_eq!(engine.state(), DialogState::Aborted);
        assert!(step.booking_rejected.is_some());
    }

    #[tokio::test]
    async fn operator_verdict_outside_awaiting_state_is_noop() {
        let mut engine = DialogEngine::new(nlu_with(vec![]));
        engine.start();
        let step = engine.on_operator_verdict(OperatorVerdict::Approve);
        assert!(step.booking_confirmed.is_none());
        assert_eq!(engine.state(), DialogState::Collecting);
    }
}
