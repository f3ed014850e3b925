use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::{
    application::{
        ports::notifier::Notifier,
        use_cases::lifecycle::{AuditStore, HookRunner},
    },
    domain::entities::{audit::NewAuditEntry, side_effect::SideEffect, subscription::Subscription},
};

const MAX_ATTEMPTS: u32 = 3;

/// Interprets committed side effects against the notification channel.
/// Delivery runs on its own task so the request that committed the
/// transition never waits out the backoff. Failures are retried; a hook
/// that exhausts its attempts is written to the audit log and dropped. The
/// state transition it followed is already committed and stays committed.
#[derive(Clone)]
pub struct HookExecutor {
    notifier: Arc<dyn Notifier>,
    audit: Arc<dyn AuditStore>,
}

impl HookExecutor {
    pub fn new(notifier: Arc<dyn Notifier>, audit: Arc<dyn AuditStore>) -> Self {
        Self { notifier, audit }
    }

    async fn deliver(&self, subscription: &Subscription, effects: &[SideEffect]) {
        for effect in effects {
            self.run_one(subscription, effect).await;
        }
    }

    async fn run_one(&self, subscription: &Subscription, effect: &SideEffect) {
        let template = effect.template();
        let data = hook_payload(subscription, effect);

        for attempt in 0..MAX_ATTEMPTS {
            match self
                .notifier
                .send(template, &subscription.customer_email, data.clone())
                .await
            {
                Ok(()) => {
                    tracing::debug!(
                        subscription_id = %subscription.id,
                        template = template,
                        "Hook delivered"
                    );
                    return;
                }
                Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                    let delay = backoff_delay_ms(attempt);
                    tracing::warn!(
                        subscription_id = %subscription.id,
                        template = template,
                        attempt = attempt + 1,
                        error = %e,
                        "Hook delivery failed, backing off"
                    );
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => {
                    tracing::error!(
                        subscription_id = %subscription.id,
                        template = template,
                        attempts = MAX_ATTEMPTS,
                        error = %e,
                        "Hook delivery exhausted its attempts"
                    );
                    let entry = NewAuditEntry {
                        subscription_id: subscription.id,
                        prior_state: subscription.state,
                        new_state: subscription.state,
                        event_kind: "hook_failed".to_string(),
                        source: "hook_executor".to_string(),
                        metadata: json!({
                            "template": template,
                            "attempts": MAX_ATTEMPTS,
                            "error": e.to_string(),
                        }),
                    };
                    if let Err(audit_err) = self.audit.append(entry).await {
                        tracing::error!(
                            subscription_id = %subscription.id,
                            error = %audit_err,
                            "Failed to audit a dropped hook"
                        );
                    }
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl HookRunner for HookExecutor {
    async fn run(&self, subscription: &Subscription, effects: &[SideEffect]) {
        if effects.is_empty() {
            return;
        }
        let executor = self.clone();
        let subscription = subscription.clone();
        let effects = effects.to_vec();
        tokio::spawn(async move {
            executor.deliver(&subscription, &effects).await;
        });
    }
}

fn hook_payload(subscription: &Subscription, effect: &SideEffect) -> serde_json::Value {
    let mut data = json!({
        "subscription_id": subscription.external_id,
        "plan_code": subscription.plan_code,
        "state": subscription.state,
    });
    if let SideEffect::SendTrialEndingNotice { days_before } = effect {
        data["days_before"] = json!(days_before);
        data["trial_end"] = json!(subscription.trial_end.map(|t| t.and_utc().timestamp()));
    }
    data
}

fn backoff_delay_ms(attempt: u32) -> u64 {
    let base: u64 = 500;
    let exponential = base.saturating_mul(4u64.saturating_pow(attempt));
    let capped = exponential.min(30_000);
    let jitter = rand::random::<u64>() % 250;
    capped + jitter
}
