use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Internal lifecycle event kinds. External processor event types are
/// normalized into these; sweep scans and manual operations synthesize
/// them directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    SubscriptionCreated,
    ActivationCompleted,
    TrialStarted,
    TrialConverted,
    TrialEnding,
    TrialEnded,
    PaymentSucceeded,
    PaymentFailed,
    RetryAttemptFailed,
    RetriesExhausted,
    GracePeriodEnded,
    PauseRequested,
    ResumeRequested,
    CancellationRequested,
    CancellationRevoked,
    CancellationCompleted,
    ReactivationRequested,
    ReactivationCompleted,
    ReactivationFailed,
    Expiration,
    AnomalyDetected,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SubscriptionCreated => "subscription_created",
            EventKind::ActivationCompleted => "activation_completed",
            EventKind::TrialStarted => "trial_started",
            EventKind::TrialConverted => "trial_converted",
            EventKind::TrialEnding => "trial_ending",
            EventKind::TrialEnded => "trial_ended",
            EventKind::PaymentSucceeded => "payment_succeeded",
            EventKind::PaymentFailed => "payment_failed",
            EventKind::RetryAttemptFailed => "retry_attempt_failed",
            EventKind::RetriesExhausted => "retries_exhausted",
            EventKind::GracePeriodEnded => "grace_period_ended",
            EventKind::PauseRequested => "pause_requested",
            EventKind::ResumeRequested => "resume_requested",
            EventKind::CancellationRequested => "cancellation_requested",
            EventKind::CancellationRevoked => "cancellation_revoked",
            EventKind::CancellationCompleted => "cancellation_completed",
            EventKind::ReactivationRequested => "reactivation_requested",
            EventKind::ReactivationCompleted => "reactivation_completed",
            EventKind::ReactivationFailed => "reactivation_failed",
            EventKind::Expiration => "expiration",
            EventKind::AnomalyDetected => "anomaly_detected",
        }
    }

    /// Map a processor event type string to an internal kind. Unknown
    /// types return None and are treated as forward-compatible no-ops.
    pub fn from_external(event_type: &str) -> Option<Self> {
        match event_type {
            "customer.subscription.created" => Some(EventKind::SubscriptionCreated),
            "customer.subscription.activated" => Some(EventKind::ActivationCompleted),
            "customer.subscription.trial_started" => Some(EventKind::TrialStarted),
            "customer.subscription.trial_converted" => Some(EventKind::TrialConverted),
            "customer.subscription.trial_will_end" => Some(EventKind::TrialEnding),
            // invoice.payment_succeeded is the newer alias some processor
            // configurations emit instead of invoice.paid.
            "invoice.paid" | "invoice.payment_succeeded" => Some(EventKind::PaymentSucceeded),
            "invoice.payment_failed" => Some(EventKind::PaymentFailed),
            "customer.subscription.paused" => Some(EventKind::PauseRequested),
            "customer.subscription.resumed" => Some(EventKind::ResumeRequested),
            "customer.subscription.cancellation_requested" => {
                Some(EventKind::CancellationRequested)
            }
            "customer.subscription.deleted" => Some(EventKind::CancellationCompleted),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSource {
    Webhook,
    Sweep,
    Manual,
}

impl EventSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventSource::Webhook => "webhook",
            EventSource::Sweep => "sweep",
            EventSource::Manual => "manual",
        }
    }
}

/// An immutable, typed fact that may move a subscription between states.
/// Created by the ingestion pipeline, the sweep runner, or a manual
/// operation; consumed exactly once (enforced by the dedup key) and then
/// archived to the audit log.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub kind: EventKind,
    pub subscription_external_id: String,
    pub source: EventSource,
    /// At-most-once key. Present for webhook- and sweep-sourced events;
    /// manual operations apply unconditionally.
    pub dedup_key: Option<String>,
    pub metadata: JsonValue,
    pub occurred_at: NaiveDateTime,
}

impl LifecycleEvent {
    pub fn webhook(
        kind: EventKind,
        external_id: impl Into<String>,
        event_id: &str,
        metadata: JsonValue,
        occurred_at: NaiveDateTime,
    ) -> Self {
        Self {
            kind,
            subscription_external_id: external_id.into(),
            source: EventSource::Webhook,
            dedup_key: Some(dedup::webhook(event_id)),
            metadata,
            occurred_at,
        }
    }

    pub fn sweep(
        kind: EventKind,
        external_id: impl Into<String>,
        dedup_key: String,
        metadata: JsonValue,
        occurred_at: NaiveDateTime,
    ) -> Self {
        Self {
            kind,
            subscription_external_id: external_id.into(),
            source: EventSource::Sweep,
            dedup_key: Some(dedup_key),
            metadata,
            occurred_at,
        }
    }

    pub fn manual(
        kind: EventKind,
        external_id: impl Into<String>,
        metadata: JsonValue,
        occurred_at: NaiveDateTime,
    ) -> Self {
        Self {
            kind,
            subscription_external_id: external_id.into(),
            source: EventSource::Manual,
            dedup_key: None,
            metadata,
            occurred_at,
        }
    }
}

/// Deterministic dedup-key builders. Sweep keys embed the triggering
/// timestamp so that re-running a sweep before the next state change is a
/// no-op, while a genuinely new crossing produces a fresh key.
pub mod dedup {
    use chrono::NaiveDateTime;
    use uuid::Uuid;

    pub fn webhook(event_id: &str) -> String {
        format!("webhook:{}", event_id)
    }

    pub fn trial_ending(subscription_id: Uuid, days_before: i64, trial_end: NaiveDateTime) -> String {
        format!(
            "sweep:trial_ending:{}:{}d:{}",
            subscription_id,
            days_before,
            trial_end.and_utc().timestamp()
        )
    }

    pub fn trial_ended(subscription_id: Uuid, trial_end: NaiveDateTime) -> String {
        format!(
            "sweep:trial_ended:{}:{}",
            subscription_id,
            trial_end.and_utc().timestamp()
        )
    }

    pub fn grace_ended(subscription_id: Uuid, state_changed_at: NaiveDateTime) -> String {
        format!(
            "sweep:grace:{}:{}",
            subscription_id,
            state_changed_at.and_utc().timestamp()
        )
    }

    pub fn cancellation_due(subscription_id: Uuid, period_end: NaiveDateTime) -> String {
        format!(
            "sweep:cancel:{}:{}",
            subscription_id,
            period_end.and_utc().timestamp()
        )
    }

    pub fn expiration(subscription_id: Uuid, state_changed_at: NaiveDateTime) -> String {
        format!(
            "sweep:expire:{}:{}",
            subscription_id,
            state_changed_at.and_utc().timestamp()
        )
    }

    pub fn retry_attempt(invoice_id: &str, day_offset: i64) -> String {
        format!("retry:{}:day{}", invoice_id, day_offset)
    }

    pub fn retry_result(invoice_id: &str, day_offset: i64) -> String {
        format!("retry_result:{}:day{}", invoice_id, day_offset)
    }

    pub fn retries_exhausted(invoice_id: &str) -> String {
        format!("retry_exhausted:{}", invoice_id)
    }
}
