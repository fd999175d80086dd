//! Booking persistence hook.
//!
//! This crate has no opinion on where an approved booking ends up — CRM,
//! calendar, SMS gateway, a message queue. It fires the hook exactly once,
//! the moment the dialog engine marks a draft `Approved`, and doesn't wait
//! on it: a slow or failing downstream integration must never hold up call
//! teardown.

use crate::dialog::slots::Slots;
use async_trait::async_trait;

#[async_trait]
pub trait OnBookingApproved: Send + Sync {
    async fn call(&self, call_id: &str, slots: &Slots);
}

/// Default no-op hook, used wherever the caller hasn't wired a real one in
/// (tests, local runs without a CRM configured).
pub struct NoopBookingHook;

#[async_trait]
impl OnBookingApproved for NoopBookingHook {
    async fn call(&self, _call_id: &str, _slots: &Slots) {}
}

/// Fire-and-forget: spawns the hook on its own task and logs if it panics or
/// the future never gets polled to completion before the process exits.
/// Never propagates an error back to the session.
pub fn invoke(hook: std::sync::Arc<dyn OnBookingApproved>, call_id: String, slots: Slots) {
    tokio::spawn(async move {
        hook.call(&call_id, &slots).await;
    });
}
