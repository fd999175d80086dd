//! Session manager: owns one call end to end.
//!
//! Spawns the inbound (codec -> VAD -> utterance buffer -> transcription ->
//! dialog) and outbound (dialog -> TTS scheduler -> codec) tasks, wires the
//! shared barge-in cancellation cell between them, enforces the call's
//! timeouts, and tears everything down exactly once no matter which of those
//! timeouts (or a WebSocket drop) fires first. One task per connection
//! concern, joined through bounded channels rather than a single monolithic
//! loop.

use crate::audio::codec::FrameCodec;
use crate::config::Config;
use crate::dialog::{AgentTurn, ClosingReason, DialogEngine, DialogState, NluProvider, OperatorVerdict};
use crate::events::{EventBus, OperatorEvent};
use crate::persistence::OnBookingApproved;
use crate::transcription::{TranscriptOutcome, TranscriptionGateway};
use crate::tts::{TtsProvider, TtsScheduler};
use crate::utterance::{UtteranceBuffer, UtteranceQueue};
use crate::vad::{Segmenter, VadEvent};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex as SyncMutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Commands an operator can issue against an in-flight call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorCommand {
    Approve,
    Reject,
}

/// What the registry hands back for a looked-up call.
#[derive(Clone)]
pub struct SessionHandle {
    pub call_id: String,
    command_tx: mpsc::Sender<OperatorCommand>,
    shutdown: CancellationToken,
}

impl SessionHandle {
    /// Route an operator command to this call. Returns `false` if the
    /// session has already torn down — the caller surfaces that as
    /// "call not found / already terminated".
    pub async fn send_command(&self, cmd: OperatorCommand) -> bool {
        self.command_tx.send(cmd).await.is_ok()
    }

    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }
}

/// Process-wide table of live calls, keyed by call id.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    calls: Arc<DashMap<String, SessionHandle>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: SessionHandle) {
        self.calls.insert(handle.call_id.clone(), handle);
    }

    pub fn remove(&self, call_id: &str) {
        self.calls.remove(call_id);
    }

    pub fn get(&self, call_id: &str) -> Option<SessionHandle> {
        self.calls.get(call_id).map(|e| e.clone())
    }

    pub fn active_count(&self) -> usize {
        self.calls.len()
    }
}

/// The lightweight record allocated the moment the webhook accepts a call —
/// before the provider ever opens the media socket. Holds exactly the
/// fields the pipeline can't recover once the WebSocket opens: the call is
/// identified only by `call_id` on that socket, so `from`/`to` have to be
/// carried forward from here.
#[derive(Debug, Clone)]
pub struct CallRecord {
    pub call_id: String,
    pub from: Option<String>,
    pub to: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Process-wide table of calls accepted at the webhook but not yet bridged
/// to a media socket. Entries are taken (removed) the moment the socket
/// opens; a call whose provider never opens the socket just leaks its entry
/// until process restart, the same way an abandoned webhook POST leaves no
/// other trace either.
#[derive(Clone, Default)]
pub struct PendingCallRegistry {
    calls: Arc<DashMap<String, CallRecord>>,
}

impl PendingCallRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, record: CallRecord) {
        self.calls.insert(record.call_id.clone(), record);
    }

    /// Remove and return the record for `call_id`, if the webhook allocated
    /// one. `None` means the media socket was opened without a matching
    /// webhook accept — the session still proceeds, just without `from`/`to`.
    pub fn take(&self, call_id: &str) -> Option<CallRecord> {
        self.calls.remove(call_id).map(|(_, record)| record)
    }
}

/// The external provider set a session needs; assembled once at startup and
/// cloned (cheaply, they're all `Arc`s) into each call.
#[derive(Clone)]
pub struct Providers {
    pub stt: Arc<dyn crate::transcription::SttProvider>,
    pub tts: Arc<dyn TtsProvider>,
    pub nlu: Arc<dyn NluProvider>,
    pub booking_hook: Arc<dyn OnBookingApproved>,
}

/// Raw inbound/outbound framing is left to the caller (the axum media
/// WebSocket handler): `inbound_rx` yields raw text frames as they arrive,
/// `outbound_tx` is where wire-ready JSON envelopes go back out.
pub struct MediaChannels {
    pub inbound_rx: mpsc::Receiver<String>,
    pub outbound_tx: mpsc::Sender<String>,
}

/// Shared axum state: one instance, cloned (cheaply — every field is an
/// `Arc` or already `Clone`) into every request handler. Assembled once in
/// `main` and threaded through [`crate::webhook`], [`crate::media_ws`], and
/// [`crate::ops_ws`].
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub event_bus: Arc<EventBus>,
    pub registry: SessionRegistry,
    pub providers: Providers,
    pub pending_calls: PendingCallRegistry,
}

struct SharedCancel(SyncMutex<CancellationToken>);

impl SharedCancel {
    fn new() -> Self {
        Self(SyncMutex::new(CancellationToken::new()))
    }

    fn fresh(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self.0.lock() = token.clone();
        token
    }

    fn cancel_current(&self) {
        self.0.lock().cancel();
    }
}

/// Spawn one call's full pipeline and register it in `registry` before any
/// frame is processed, so an operator command racing the greeting still
/// finds the call. The registry entry is removed by the session itself when
/// its task exits — never by the media WebSocket handler — so a call stuck
/// in `AwaitingOperator` after the socket closes stays reachable by call id
/// until an operator verdict or the operator timeout resolves it.
///
/// `from`/`to` are whatever the webhook captured when it accepted the call
/// (see [`CallRecord`]); `None` if the media socket opened without a
/// matching webhook accept.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    call_id: String,
    from: Option<String>,
    to: Option<String>,
    config: Arc<Config>,
    event_bus: Arc<EventBus>,
    providers: Providers,
    media: MediaChannels,
    registry: SessionRegistry,
) -> SessionHandle {
    let (command_tx, command_rx) = mpsc::channel(8);
    let shutdown = CancellationToken::new();

    let handle = SessionHandle {
        call_id: call_id.clone(),
        command_tx,
        shutdown: shutdown.clone(),
    };
    registry.insert(handle.clone());

    tokio::spawn(run_call(call_id, from, to, config, event_bus, providers, media, command_rx, shutdown, registry));

    handle
}

#[allow(clippy::too_many_arguments)]
async fn run_call(
    call_id: String,
    from: Option<String>,
    to: Option<String>,
    config: Arc<Config>,
    event_bus: Arc<EventBus>,
    providers: Providers,
    media: MediaChannels,
    mut command_rx: mpsc::Receiver<OperatorCommand>,
    shutdown: CancellationToken,
    registry: SessionRegistry,
) {
    event_bus.publish(&call_id, OperatorEvent::CallStarted { from: from.clone(), to: to.clone() });
    info!(call_id = %call_id, from = ?from, to = ?to, "call started");

    let codec = FrameCodec::new(config.vad.frame_ms);
    let mut segmenter = match Segmenter::new(config.vad.clone()) {
        Ok(s) => s,
        Err(e) => {
            warn!(call_id = %call_id, error = %e, "failed to initialize VAD, aborting call");
            event_bus.publish(&call_id, OperatorEvent::CallEnded { reason: "vad_init_failed".into() });
            return;
        }
    };
    let mut utterance_buffer = UtteranceBuffer::new(config.transcription.min_utterance_ms, config.transcription.min_utterance_rms);
    let (utterance_queue, mut utterance_handle) = UtteranceQueue::bounded(config.utterance_queue_depth);

    let mut gateway = TranscriptionGateway::new(providers.stt.clone(), config.transcription.clone());
    let mut dialog = DialogEngine::new(providers.nlu.clone());
    let tts_scheduler = TtsScheduler::new(
        providers.tts.clone(),
        config.providers.tts_voice_id.clone(),
        config.vad.frame_ms,
        crate::audio::constants::PCM_SAMPLE_RATE,
    );

    let barge_in = Arc::new(SharedCancel::new());
    let mut inbound_rx = media.inbound_rx;

    // The outbound task runs on its own task so a SpeechStart on the inbound
    // pipeline can reach `barge_in.cancel_current()` while a turn is
    // mid-playback: the two tasks only share `barge_in` and the bounded
    // channels below, so this loop's `tokio::select!` keeps polling
    // `inbound_rx` the entire time the TTS scheduler is synthesizing and
    // pacing frames out.
    let (turn_tx, turn_rx) = mpsc::channel::<AgentTurn>(8);
    let (hangup_tx, mut hangup_rx) = mpsc::channel::<()>(1);
    let outbound_task = tokio::spawn(run_outbound(tts_scheduler, media.outbound_tx, barge_in.clone(), turn_rx, hangup_tx));
    let mut hangup_received = false;

    // Opening greeting.
    let greeting = dialog.start();
    event_bus.publish(&call_id, OperatorEvent::AgentSaid { text: greeting.text.clone() });
    let _ = turn_tx.send(greeting).await;

    let mut inactivity_windows = 0u32;
    let mut speech_since_last_tick = false;
    let call_deadline = tokio::time::sleep(config.timeouts.call_max);
    tokio::pin!(call_deadline);
    let mut silence_ticker = tokio::time::interval(config.timeouts.caller_silence);
    silence_ticker.tick().await; // consume the immediate first tick

    // Armed the moment the dialog enters AwaitingOperator: the
    // operator may approve or reject up to `operator_timeout` later, even
    // after the media socket has already closed following the terminal
    // confirmation turn. Firing it is equivalent to an explicit reject.
    let operator_deadline = tokio::time::sleep(config.timeouts.operator_timeout);
    tokio::pin!(operator_deadline);
    let mut operator_deadline_armed = false;

    // Once the provider closes the media socket, `inbound_rx` is exhausted
    // forever; polling a finished `recv()` in a loop would spin. Track it so
    // the select below can stop offering that branch once it has fired,
    // while still letting AwaitingOperator keep the task alive for a
    // late-arriving operator verdict.
    let mut media_closed = false;

    // Set once a forced closing (call-max, inactivity, STT failure) has been
    // handed to F, so the one-shot/interval timers that triggered it don't
    // fire a second `dialog.close()` while F is still draining the farewell.
    let mut shutting_down = false;

    'outer: loop {
        if dialog.state() == DialogState::AwaitingOperator && !operator_deadline_armed {
            operator_deadline
                .as_mut()
                .reset(tokio::time::Instant::now() + config.timeouts.operator_timeout);
            operator_deadline_armed = true;
        }

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(call_id = %call_id, "shutdown requested");
                break 'outer;
            }
            _ = &mut call_deadline, if !shutting_down && dialog.state() != DialogState::AwaitingOperator => {
                info!(call_id = %call_id, "call max duration exceeded");
                shutting_down = true;
                let step = dialog.close(ClosingReason::CallMaxExceeded);
                dispatch_step(&call_id, &turn_tx, &event_bus, &providers, step).await;
            }
            _ = &mut operator_deadline, if operator_deadline_armed => {
                info!(call_id = %call_id, "operator verdict timed out");
                apply_verdict(&call_id, &mut dialog, &turn_tx, &event_bus, &providers, OperatorVerdict::Timeout).await;
                break 'outer;
            }
            _ = silence_ticker.tick(), if !shutting_down && dialog.state() != DialogState::AwaitingOperator => {
                if speech_since_last_tick {
                    inactivity_windows = 0;
                } else {
                    inactivity_windows += 1;
                    if inactivity_windows >= 3 {
                        info!(call_id = %call_id, "caller inactive for 3 consecutive windows");
                        shutting_down = true;
                        let step = dialog.close(ClosingReason::InactivityExceeded);
                        dispatch_step(&call_id, &turn_tx, &event_bus, &providers, step).await;
                    } else {
                        // Each window short of the third gets an automatic
                        // reprompt from the dialog engine rather than silent counting.
                        let step = dialog.on_inactivity();
                        dispatch_step(&call_id, &turn_tx, &event_bus, &providers, step).await;
                    }
                }
                speech_since_last_tick = false;
            }
            cmd = command_rx.recv() => {
                let Some(cmd) = cmd else { continue };
                if dialog.state() != DialogState::AwaitingOperator {
                    continue;
                }
                let verdict = match cmd {
                    OperatorCommand::Approve => OperatorVerdict::Approve,
                    OperatorCommand::Reject => OperatorVerdict::Reject,
                };
                apply_verdict(&call_id, &mut dialog, &turn_tx, &event_bus, &providers, verdict).await;
                if dialog.state() == DialogState::Farewell || dialog.state() == DialogState::Aborted {
                    break 'outer;
                }
            }
            hangup = hangup_rx.recv(), if !hangup_received => {
                hangup_received = true;
                media_closed = true;
                match hangup {
                    Some(()) => info!(call_id = %call_id, "terminal turn completed, media leg closing"),
                    None => warn!(call_id = %call_id, "outbound task ended without a terminal turn"),
                }
                if dialog.state() != DialogState::AwaitingOperator {
                    break 'outer;
                }
                // AwaitingOperator: audio is done but the task stays alive on
                // command_rx/operator_deadline for a pending verdict.
            }
            raw = inbound_rx.recv(), if !media_closed => {
                let Some(raw) = raw else {
                    media_closed = true;
                    if dialog.state() != DialogState::AwaitingOperator {
                        warn!(call_id = %call_id, "media websocket closed");
                        break 'outer;
                    }
                    // Operator verdict is still pending: keep the task alive
                    // on command_rx/operator_deadline alone — approval after
                    // hangup must still land.
                    continue;
                };
                let frame = match codec.decode_inbound(&raw) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => continue,
                    Err(e) => {
                        warn!(call_id = %call_id, error = %e, "malformed inbound frame, dropping");
                        continue;
                    }
                };

                let was_in_speech = segmenter.is_in_speech();
                let event = match segmenter.process(&frame) {
                    Ok(ev) => ev,
                    Err(e) => {
                        warn!(call_id = %call_id, error = %e, "VAD processing error, dropping frame");
                        continue;
                    }
                };

                if let Some(VadEvent::SpeechStart) = event {
                    utterance_buffer.on_speech_start();
                    barge_in.cancel_current();
                    speech_since_last_tick = true;
                }
                if was_in_speech || matches!(event, Some(VadEvent::SpeechStart)) {
                    utterance_buffer.push_samples(&frame.samples);
                    speech_since_last_tick = true;
                }
                if let Some(VadEvent::SpeechEnd { .. }) = event {
                    if let Some(utterance) = utterance_buffer.on_speech_end() {
                        utterance_queue.push(utterance);
                    }
                }
            }
            utterance = utterance_handle.recv() => {
                let Some(utterance) = utterance else { continue };
                match gateway.submit(&utterance).await {
                    TranscriptOutcome::Accepted(transcript) => {
                        event_bus.publish(&call_id, OperatorEvent::Transcript {
                            text: transcript.text.clone(),
                            confidence: transcript.avg_log_prob,
                        });
                        let step = dialog.on_transcript(&transcript).await;
                        dispatch_step(&call_id, &turn_tx, &event_bus, &providers, step).await;
                    }
                    TranscriptOutcome::Rejected => {
                        let step = dialog.register_unintelligible();
                        dispatch_step(&call_id, &turn_tx, &event_bus, &providers, step).await;
                    }
                    TranscriptOutcome::ProviderError(e) => {
                        warn!(call_id = %call_id, error = %e, "STT provider error");
                        if e.is_fatal_to_call() {
                            // Not recoverable mid-call.
                            // Apologize and end the call; the process itself
                            // keeps running for other calls.
                            if !shutting_down {
                                shutting_down = true;
                                let step = dialog.close(ClosingReason::SttProviderFailure);
                                dispatch_step(&call_id, &turn_tx, &event_bus, &providers, step).await;
                            }
                            continue;
                        }
                        if gateway.is_degraded() {
                            event_bus.publish(&call_id, OperatorEvent::Degraded { reason: e.reason_code().into() });
                        }
                        let step = dialog.register_unintelligible();
                        dispatch_step(&call_id, &turn_tx, &event_bus, &providers, step).await;
                    }
                }
            }
        }
    }

    if let Some(ev) = segmenter.force_end() {
        if let VadEvent::SpeechEnd { .. } = ev {
            if let Some(utterance) = utterance_buffer.on_speech_end() {
                utterance_queue.push(utterance);
            }
        }
    }

    // Let F drain whatever it already has queued, then give up on it — the
    // call is ending either way once `registry.remove` below runs.
    drop(turn_tx);
    if tokio::time::timeout(config.timeouts.drain_window, outbound_task).await.is_err() {
        warn!(call_id = %call_id, "outbound task did not drain within the grace window");
    }

    registry.remove(&call_id);
    event_bus.forget_call(&call_id);
    event_bus.publish(&call_id, OperatorEvent::CallEnded { reason: "closed".into() });
    info!(call_id = %call_id, "call ended");
}

/// The outbound (TTS playback) task: plays turns handed to it over `turn_rx`
/// one at a time, in order, racing each interruptible turn against
/// `barge_in`. Once a turn marked `terminal` finishes — completed or failed
/// over to its fallback clip, never interrupted, since every terminal turn
/// is also non-interruptible by construction — it tells the session task via
/// `hangup_tx` and drops `outbound_tx`, closing the media leg. No outbound
/// audio is scheduled past that point, so the task simply ends.
async fn run_outbound(
    tts_scheduler: TtsScheduler,
    outbound_tx: mpsc::Sender<String>,
    barge_in: Arc<SharedCancel>,
    mut turn_rx: mpsc::Receiver<AgentTurn>,
    hangup_tx: mpsc::Sender<()>,
) {
    while let Some(turn) = turn_rx.recv().await {
        let terminal = turn.terminal;
        let token = barge_in.fresh();
        tts_scheduler.speak(&turn, &outbound_tx, &token).await;
        if terminal {
            let _ = hangup_tx.send(()).await;
            break;
        }
    }
}

/// Hand a dialog step's turns to the outbound task in order and publish its
/// event-bus side effects. Never waits for playback — the outbound task
/// plays concurrently with the inbound pipeline; the session instead learns
/// a terminal turn has finished playing via `hangup_rx`.
async fn dispatch_step(
    call_id: &str,
    turn_tx: &mpsc::Sender<AgentTurn>,
    event_bus: &EventBus,
    providers: &Providers,
    step: crate::dialog::DialogStep,
) {
    for turn in step.turns {
        event_bus.publish(call_id, OperatorEvent::AgentSaid { text: turn.text.clone() });
        if turn_tx.send(turn).await.is_err() {
            // F has already ended (a prior terminal turn finished first).
            break;
        }
    }

    if let Some(draft) = step.booking_pending {
        event_bus.publish(call_id, OperatorEvent::BookingPending { slots: draft.slots.clone() });
    }
    if let Some(draft) = step.booking_confirmed {
        event_bus.publish(call_id, OperatorEvent::BookingConfirmed { slots: draft.slots.clone() });
        crate::persistence::invoke(providers.booking_hook.clone(), call_id.to_string(), draft.slots.clone());
    }
    if let Some(draft) = step.booking_rejected {
        event_bus.publish(call_id, OperatorEvent::BookingRejected { slots: draft.slots.clone() });
    }
}

async fn apply_verdict(
    call_id: &str,
    dialog: &mut DialogEngine,
    turn_tx: &mpsc::Sender<AgentTurn>,
    event_bus: &EventBus,
    providers: &Providers,
    verdict: OperatorVerdict,
) {
    let step = dialog.on_operator_verdict(verdict);
    dispatch_step(call_id, turn_tx, event_bus, providers, step).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_call_registry_round_trips_and_is_one_shot() {
        let pending = PendingCallRegistry::new();
        pending.insert(CallRecord {
            call_id: "call-1".into(),
            from: Some("+15551230000".into()),
            to: Some("+15559990000".into()),
            created_at: Utc::now(),
        });

        let record = pending.take("call-1").expect("record should be present");
        assert_eq!(record.from.as_deref(), Some("+15551230000"));
        assert_eq!(record.to.as_deref(), Some("+15559990000"));
        assert!(pending.take("call-1").is_none(), "take should remove the record");
    }

    #[test]
    fn pending_call_registry_returns_none_for_unknown_call() {
        let pending = PendingCallRegistry::new();
        assert!(pending.take("never-accepted").is_none());
    }

    #[test]
    fn registry_round_trips_a_handle() {
        let registry = SessionRegistry::new();
        let (tx, _rx) = mpsc::channel(1);
        let handle = SessionHandle {
            call_id: "call-1".into(),
            command_tx: tx,
            shutdown: CancellationToken::new(),
        };
        registry.insert(handle);
        assert!(registry.get("call-1").is_some());
        assert_eq!(registry.active_count(), 1);
        registry.remove("call-1");
        assert!(registry.get("call-1").is_none());
    }

    #[tokio::test]
    async fn send_command_reports_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = SessionHandle {
            call_id: "call-1".into(),
            command_tx: tx,
            shutdown: CancellationToken::new(),
        };
        assert!(!handle.send_command(OperatorCommand::Approve).await);
    }
}
