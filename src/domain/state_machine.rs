//! Pure transition engine: a table mapping (state, event kind) to the next
//! state, plus planning of the field changes and post-commit hooks each
//! transition carries. The engine knows nothing about webhooks or timers.

use chrono::{DateTime, NaiveDateTime};
use thiserror::Error;

use crate::domain::entities::lifecycle_event::{EventKind, LifecycleEvent};
use crate::domain::entities::side_effect::SideEffect;
use crate::domain::entities::subscription::{Subscription, SubscriptionState};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition: {event} cannot apply in state {from}")]
pub struct InvalidTransition {
    pub from: SubscriptionState,
    pub event: EventKind,
}

/// Field mutations applied atomically with the state write. Everything here
/// commits in the same transaction as the new state, or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldChanges {
    pub set_canceled_at: Option<NaiveDateTime>,
    pub clear_canceled_at: bool,
    pub set_cancellation_reason: Option<String>,
    pub clear_cancellation_reason: bool,
    pub set_cancel_at_period_end: Option<bool>,
    pub set_paused_at: Option<NaiveDateTime>,
    pub set_pause_until: Option<NaiveDateTime>,
    pub clear_pause: bool,
    pub set_trial: Option<(NaiveDateTime, NaiveDateTime)>,
    pub roll_period_to: Option<(NaiveDateTime, NaiveDateTime)>,
    pub set_failing_invoice_id: Option<String>,
    pub clear_failing_invoice: bool,
    pub set_last_failure_at: Option<NaiveDateTime>,
    pub bump_retry_count: bool,
    pub reset_retries: bool,
}

impl FieldChanges {
    pub fn apply(&self, sub: &mut Subscription) {
        if let Some(at) = self.set_canceled_at {
            sub.canceled_at = Some(at);
        }
        if self.clear_canceled_at {
            sub.canceled_at = None;
        }
        if let Some(ref reason) = self.set_cancellation_reason {
            sub.cancellation_reason = Some(reason.clone());
        }
        if self.clear_cancellation_reason {
            sub.cancellation_reason = None;
        }
        if let Some(flag) = self.set_cancel_at_period_end {
            sub.cancel_at_period_end = flag;
        }
        if let Some(at) = self.set_paused_at {
            sub.paused_at = Some(at);
        }
        if let Some(until) = self.set_pause_until {
            sub.pause_until = Some(until);
        }
        if self.clear_pause {
            sub.paused_at = None;
            sub.pause_until = None;
        }
        if let Some((start, end)) = self.set_trial {
            sub.trial_start = Some(start);
            sub.trial_end = Some(end);
        }
        if let Some((start, end)) = self.roll_period_to {
            sub.current_period_start = start;
            sub.current_period_end = end;
        }
        if let Some(ref invoice) = self.set_failing_invoice_id {
            sub.failing_invoice_id = Some(invoice.clone());
        }
        if self.clear_failing_invoice {
            sub.failing_invoice_id = None;
        }
        if let Some(at) = self.set_last_failure_at {
            sub.last_failure_at = Some(at);
        }
        if self.bump_retry_count {
            sub.retry_count += 1;
        }
        if self.reset_retries {
            sub.retry_count = 0;
            sub.last_failure_at = None;
        }
    }
}

/// The outcome of planning a transition: the target state, the field
/// mutations to commit with it, and the hooks to run after the commit.
#[derive(Debug, Clone, PartialEq)]
pub struct TransitionPlan {
    pub new_state: SubscriptionState,
    pub changes: FieldChanges,
    pub side_effects: Vec<SideEffect>,
}

/// The transition table. Any (state, kind) pair absent here is invalid and
/// must be rejected without mutating anything.
pub fn transition(state: SubscriptionState, kind: EventKind) -> Option<SubscriptionState> {
    use EventKind::*;
    use SubscriptionState::*;

    match (state, kind) {
        (Draft, SubscriptionCreated) => Some(PendingActivation),
        (PendingActivation, ActivationCompleted) => Some(Active),
        (PendingActivation, TrialStarted) => Some(Trialing),

        (Trialing, TrialConverted) => Some(Active),
        (Trialing, TrialEnded) => Some(PastDue),
        // Notification-only self-transition; the dedup key makes it fire
        // once per threshold.
        (Trialing, TrialEnding) => Some(Trialing),

        (Active, PaymentSucceeded) => Some(Active),
        (Active, PaymentFailed) => Some(PastDue),
        (Active, PauseRequested) => Some(Suspended),

        (PastDue, PaymentSucceeded) => Some(Active),
        (PastDue, PaymentFailed) => Some(PastDue),
        (PastDue, RetryAttemptFailed) => Some(PastDue),
        (PastDue, RetriesExhausted) => Some(PastDue),
        (PastDue, GracePeriodEnded) => Some(Unpaid),

        (Unpaid, PaymentSucceeded) => Some(Active),
        (Suspended, ResumeRequested) => Some(Active),

        (Active | PastDue | Unpaid | Suspended, CancellationRequested) => Some(Canceling),
        (Canceling, CancellationCompleted) => Some(Canceled),
        (Canceling, CancellationRevoked) => Some(Active),

        (Canceled | Unpaid | Suspended | Error, ReactivationRequested) => Some(Reactivating),
        (Reactivating, ReactivationCompleted) => Some(Active),
        (Reactivating, ReactivationFailed) => Some(Canceled),

        (Unpaid | Suspended, Expiration) => Some(Expired),

        (from, AnomalyDetected) if !from.is_terminal() => Some(Error),

        _ => None,
    }
}

/// Compute the full transition plan for an event against a subscription's
/// current state. Pure: nothing is read or written beyond the arguments.
pub fn plan(sub: &Subscription, event: &LifecycleEvent) -> Result<TransitionPlan, InvalidTransition> {
    let new_state = transition(sub.state, event.kind).ok_or(InvalidTransition {
        from: sub.state,
        event: event.kind,
    })?;

    let mut changes = FieldChanges::default();
    let mut side_effects = Vec::new();
    let meta = &event.metadata;

    match event.kind {
        EventKind::SubscriptionCreated | EventKind::ActivationCompleted => {
            if let Some(period) = metadata_period(meta) {
                changes.roll_period_to = Some(period);
            }
        }
        EventKind::TrialStarted => {
            if let Some(trial) = metadata_window(meta, "trial_start", "trial_end") {
                changes.set_trial = Some(trial);
            }
        }
        EventKind::TrialConverted => {
            if let Some(period) = metadata_period(meta) {
                changes.roll_period_to = Some(period);
            }
            changes.reset_retries = true;
        }
        EventKind::TrialEnding => {
            let days = meta.get("days_before").and_then(|v| v.as_i64()).unwrap_or(0);
            side_effects.push(SideEffect::SendTrialEndingNotice { days_before: days });
        }
        EventKind::TrialEnded => {
            changes.set_last_failure_at = Some(event.occurred_at);
            side_effects.push(SideEffect::SendTrialEndedNotice);
        }
        EventKind::PaymentSucceeded => {
            changes.reset_retries = true;
            changes.clear_failing_invoice = true;
            if let Some(period) = metadata_period(meta) {
                changes.roll_period_to = Some(period);
            }
            if matches!(sub.state, SubscriptionState::PastDue | SubscriptionState::Unpaid) {
                side_effects.push(SideEffect::SendPaymentRecoveredNotice);
            }
        }
        EventKind::PaymentFailed => {
            changes.set_last_failure_at = Some(event.occurred_at);
            if let Some(invoice) = meta.get("invoice_id").and_then(|v| v.as_str()) {
                changes.set_failing_invoice_id = Some(invoice.to_string());
            }
            side_effects.push(SideEffect::SendPaymentFailedNotice);
        }
        // Only the counter moves; last_failure_at stays anchored at the
        // original failure so the retry schedule is measured from it.
        EventKind::RetryAttemptFailed => {
            changes.bump_retry_count = true;
        }
        EventKind::RetriesExhausted => {
            side_effects.push(SideEffect::SendRetriesExhaustedNotice);
        }
        EventKind::GracePeriodEnded => {
            side_effects.push(SideEffect::SendGracePeriodEndedNotice);
        }
        EventKind::PauseRequested => {
            changes.set_paused_at = Some(event.occurred_at);
            if let Some(until) = metadata_timestamp(meta, "pause_until") {
                changes.set_pause_until = Some(until);
            }
            side_effects.push(SideEffect::SendPauseNotice);
        }
        EventKind::ResumeRequested => {
            changes.clear_pause = true;
            side_effects.push(SideEffect::SendResumeNotice);
        }
        EventKind::CancellationRequested => {
            let at_period_end = meta
                .get("at_period_end")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            changes.set_cancel_at_period_end = Some(at_period_end);
            if let Some(reason) = meta.get("reason").and_then(|v| v.as_str()) {
                changes.set_cancellation_reason = Some(reason.to_string());
            }
        }
        EventKind::CancellationRevoked => {
            changes.set_cancel_at_period_end = Some(false);
            changes.clear_cancellation_reason = true;
        }
        EventKind::CancellationCompleted => {
            changes.set_canceled_at = Some(event.occurred_at);
            changes.set_cancel_at_period_end = Some(false);
            side_effects.push(SideEffect::SendCancellationNotice);
        }
        EventKind::ReactivationRequested => {}
        EventKind::ReactivationCompleted => {
            changes.clear_canceled_at = true;
            changes.clear_cancellation_reason = true;
            changes.clear_pause = true;
            changes.reset_retries = true;
            changes.clear_failing_invoice = true;
            if let Some(period) = metadata_period(meta) {
                changes.roll_period_to = Some(period);
            }
            side_effects.push(SideEffect::SendReactivationNotice);
        }
        EventKind::ReactivationFailed => {
            changes.set_canceled_at = Some(event.occurred_at);
        }
        EventKind::Expiration => {
            changes.set_canceled_at = Some(event.occurred_at);
            side_effects.push(SideEffect::SendExpirationNotice);
        }
        EventKind::AnomalyDetected => {}
    }

    Ok(TransitionPlan {
        new_state,
        changes,
        side_effects,
    })
}

fn metadata_timestamp(meta: &serde_json::Value, key: &str) -> Option<NaiveDateTime> {
    meta.get(key)
        .and_then(|v| v.as_i64())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.naive_utc())
}

fn metadata_window(
    meta: &serde_json::Value,
    start_key: &str,
    end_key: &str,
) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let start = metadata_timestamp(meta, start_key)?;
    let end = metadata_timestamp(meta, end_key)?;
    (end >= start).then_some((start, end))
}

fn metadata_period(meta: &serde_json::Value) -> Option<(NaiveDateTime, NaiveDateTime)> {
    metadata_window(meta, "period_start", "period_end")
}
