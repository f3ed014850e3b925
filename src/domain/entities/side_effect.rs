use serde::{Deserialize, Serialize};

/// Post-commit hooks, represented as data rather than closures so a fixed
/// executor can interpret, log, and retry them uniformly. A hook failure
/// never rolls back the state transition it followed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum SideEffect {
    SendTrialEndingNotice { days_before: i64 },
    SendTrialEndedNotice,
    SendPaymentFailedNotice,
    SendPaymentRecoveredNotice,
    SendGracePeriodEndedNotice,
    SendCancellationNotice,
    SendExpirationNotice,
    SendRetriesExhaustedNotice,
    SendPauseNotice,
    SendResumeNotice,
    SendReactivationNotice,
}

impl SideEffect {
    /// Template name handed to the notification channel.
    pub fn template(&self) -> &'static str {
        match self {
            SideEffect::SendTrialEndingNotice { .. } => "trial_ending",
            SideEffect::SendTrialEndedNotice => "trial_ended",
            SideEffect::SendPaymentFailedNotice => "payment_failed",
            SideEffect::SendPaymentRecoveredNotice => "payment_recovered",
            SideEffect::SendGracePeriodEndedNotice => "grace_period_ended",
            SideEffect::SendCancellationNotice => "subscription_canceled",
            SideEffect::SendExpirationNotice => "subscription_expired",
            SideEffect::SendRetriesExhaustedNotice => "payment_retries_exhausted",
            SideEffect::SendPauseNotice => "subscription_paused",
            SideEffect::SendResumeNotice => "subscription_resumed",
            SideEffect::SendReactivationNotice => "subscription_reactivated",
        }
    }
}
