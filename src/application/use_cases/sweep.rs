use std::sync::Arc;

use chrono::{Duration, NaiveDateTime};
use serde_json::json;

use crate::{
    app_error::AppResult,
    application::{
        ports::payment_processor::PaymentProcessorClient,
        use_cases::lifecycle::{
            ApplyOutcome, IdempotencyStore, LifecycleUseCases, SubscriptionStore,
        },
    },
    domain::entities::{
        lifecycle_event::{dedup, EventKind, LifecycleEvent},
        subscription::{Subscription, SubscriptionState},
    },
};

/// Per-scan row cap. Backlogs larger than this drain over successive ticks.
const SCAN_LIMIT: i64 = 500;

/// Trial-ending notice thresholds, in days before trial_end, largest first.
/// Each tick emits at most the smallest threshold already crossed; earlier
/// thresholds get their own notice on earlier ticks.
const TRIAL_NOTICE_DAYS: [i64; 3] = [3, 1, 0];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub trial_notices: u64,
    pub trials_ended: u64,
    pub grace_endings: u64,
    pub cancellations: u64,
    pub expirations: u64,
    pub retry_attempts: u64,
    pub retries_exhausted: u64,
    pub purged_idempotency: u64,
}

/// Time-based scans. Each scan finds rows whose clocks have run out and
/// pushes synthesized events through the same engine the webhooks use, so
/// every guarantee (locking, dedup, audit) holds for sweep work too.
#[derive(Clone)]
pub struct SweepUseCases {
    store: Arc<dyn SubscriptionStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    processor: Arc<dyn PaymentProcessorClient>,
    lifecycle: LifecycleUseCases,
    grace_period_days: i64,
    auto_cancel_days: i64,
    retry_schedule_days: Vec<i64>,
    max_retry_attempts: i32,
    idempotency_retention_days: i64,
}

impl SweepUseCases {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        processor: Arc<dyn PaymentProcessorClient>,
        lifecycle: LifecycleUseCases,
        grace_period_days: i64,
        auto_cancel_days: i64,
        retry_schedule_days: Vec<i64>,
        max_retry_attempts: i32,
        idempotency_retention_days: i64,
    ) -> Self {
        Self {
            store,
            idempotency,
            processor,
            lifecycle,
            grace_period_days,
            auto_cancel_days,
            retry_schedule_days,
            max_retry_attempts,
            idempotency_retention_days,
        }
    }

    /// One full sweep pass. Scans are independent; a failure in one is
    /// logged and does not stop the others.
    pub async fn run_once(&self, now: NaiveDateTime) -> SweepReport {
        let mut report = SweepReport::default();

        if let Err(e) = self.scan_trials(now, &mut report).await {
            tracing::error!(error = %e, "Trial scan failed");
        }
        if let Err(e) = self.scan_grace_endings(now, &mut report).await {
            tracing::error!(error = %e, "Grace-period scan failed");
        }
        if let Err(e) = self.scan_cancellations(now, &mut report).await {
            tracing::error!(error = %e, "Cancellation scan failed");
        }
        if let Err(e) = self.scan_expirations(now, &mut report).await {
            tracing::error!(error = %e, "Expiration scan failed");
        }
        if let Err(e) = self.scan_payment_retries(now, &mut report).await {
            tracing::error!(error = %e, "Payment-retry scan failed");
        }
        match self.purge_idempotency(now).await {
            Ok(purged) => report.purged_idempotency = purged,
            Err(e) => tracing::error!(error = %e, "Idempotency purge failed"),
        }

        report
    }

    pub async fn purge_idempotency(&self, now: NaiveDateTime) -> AppResult<u64> {
        let purged = self.idempotency.purge_expired(now).await?;
        if purged > 0 {
            tracing::debug!(purged, "Purged expired idempotency records");
        }
        Ok(purged)
    }

    pub async fn scan_trials(&self, now: NaiveDateTime, report: &mut SweepReport) -> AppResult<()> {
        let lookahead = TRIAL_NOTICE_DAYS[0];
        let rows = self
            .store
            .find_trials_ending_before(now + Duration::days(lookahead), SCAN_LIMIT)
            .await?;

        for sub in rows {
            let Some(trial_end) = sub.trial_end else {
                continue;
            };

            if trial_end <= now {
                let event = LifecycleEvent::sweep(
                    EventKind::TrialEnded,
                    &sub.external_id,
                    dedup::trial_ended(sub.id, trial_end),
                    json!({ "trial_end": trial_end.and_utc().timestamp() }),
                    now,
                );
                if self.apply_counted(&event).await? {
                    report.trials_ended += 1;
                }
                continue;
            }

            let days_until = (trial_end - now).num_days();
            let Some(threshold) = TRIAL_NOTICE_DAYS
                .into_iter()
                .rev()
                .find(|t| *t >= days_until)
            else {
                continue;
            };

            let event = LifecycleEvent::sweep(
                EventKind::TrialEnding,
                &sub.external_id,
                dedup::trial_ending(sub.id, threshold, trial_end),
                json!({
                    "days_before": threshold,
                    "trial_end": trial_end.and_utc().timestamp(),
                }),
                now,
            );
            if self.apply_counted(&event).await? {
                report.trial_notices += 1;
            }
        }
        Ok(())
    }

    pub async fn scan_grace_endings(
        &self,
        now: NaiveDateTime,
        report: &mut SweepReport,
    ) -> AppResult<()> {
        let cutoff = now - Duration::days(self.grace_period_days);
        let rows = self
            .store
            .find_in_state_entered_before(SubscriptionState::PastDue, cutoff, SCAN_LIMIT)
            .await?;

        for sub in rows {
            let event = LifecycleEvent::sweep(
                EventKind::GracePeriodEnded,
                &sub.external_id,
                dedup::grace_ended(sub.id, sub.state_changed_at),
                json!({ "grace_period_days": self.grace_period_days }),
                now,
            );
            if self.apply_counted(&event).await? {
                report.grace_endings += 1;
            }
        }
        Ok(())
    }

    pub async fn scan_cancellations(
        &self,
        now: NaiveDateTime,
        report: &mut SweepReport,
    ) -> AppResult<()> {
        let rows = self.store.find_cancellations_due(now, SCAN_LIMIT).await?;

        for sub in rows {
            let event = LifecycleEvent::sweep(
                EventKind::CancellationCompleted,
                &sub.external_id,
                dedup::cancellation_due(sub.id, sub.current_period_end),
                json!({ "period_end": sub.current_period_end.and_utc().timestamp() }),
                now,
            );
            if self.apply_counted(&event).await? {
                report.cancellations += 1;
            }
        }
        Ok(())
    }

    pub async fn scan_expirations(
        &self,
        now: NaiveDateTime,
        report: &mut SweepReport,
    ) -> AppResult<()> {
        let cutoff = now - Duration::days(self.auto_cancel_days);
        for state in [SubscriptionState::Unpaid, SubscriptionState::Suspended] {
            let rows = self
                .store
                .find_in_state_entered_before(state, cutoff, SCAN_LIMIT)
                .await?;
            for sub in rows {
                let event = LifecycleEvent::sweep(
                    EventKind::Expiration,
                    &sub.external_id,
                    dedup::expiration(sub.id, sub.state_changed_at),
                    json!({ "auto_cancel_days": self.auto_cancel_days }),
                    now,
                );
                if self.apply_counted(&event).await? {
                    report.expirations += 1;
                }
            }
        }
        Ok(())
    }

    /// Retry collection on failing invoices per the day-offset schedule.
    /// The idempotency claim happens before the processor call so that two
    /// concurrent sweeps can never charge the same attempt twice.
    pub async fn scan_payment_retries(
        &self,
        now: NaiveDateTime,
        report: &mut SweepReport,
    ) -> AppResult<()> {
        let rows = self.store.find_retry_candidates(SCAN_LIMIT).await?;

        for sub in rows {
            let Some(invoice_id) = sub.failing_invoice_id.clone() else {
                continue;
            };

            // Exhausted when the counter hits the cap or there is no
            // schedule offset left for the next attempt.
            let schedule_spent = sub.retry_count as usize >= self.retry_schedule_days.len();
            if sub.retry_count >= self.max_retry_attempts || schedule_spent {
                let event = LifecycleEvent::sweep(
                    EventKind::RetriesExhausted,
                    &sub.external_id,
                    dedup::retries_exhausted(&invoice_id),
                    json!({ "invoice_id": invoice_id, "attempts": sub.retry_count }),
                    now,
                );
                if self.apply_counted(&event).await? {
                    report.retries_exhausted += 1;
                }
                continue;
            }

            let Some(anchor) = sub.last_failure_at else {
                continue;
            };
            let offset = self.retry_schedule_days[sub.retry_count as usize];
            if now < anchor + Duration::days(offset) {
                continue;
            }

            let claim_key = dedup::retry_attempt(&invoice_id, offset);
            if !self
                .idempotency
                .record(&claim_key, "claimed", self.idempotency_retention_days)
                .await?
            {
                continue;
            }

            tracing::info!(
                subscription_id = %sub.id,
                invoice_id = %invoice_id,
                day_offset = offset,
                attempt = sub.retry_count + 1,
                "Retrying failed invoice"
            );
            report.retry_attempts += 1;

            match self.processor.retry_invoice(&invoice_id).await {
                Ok(outcome) => {
                    let (kind, metadata) = if outcome.succeeded {
                        (
                            EventKind::PaymentSucceeded,
                            json!({ "invoice_id": invoice_id, "retry_day": offset }),
                        )
                    } else {
                        (
                            EventKind::RetryAttemptFailed,
                            json!({
                                "invoice_id": invoice_id,
                                "retry_day": offset,
                                "failure_code": outcome.failure_code,
                            }),
                        )
                    };
                    let event = LifecycleEvent::sweep(
                        kind,
                        &sub.external_id,
                        dedup::retry_result(&invoice_id, offset),
                        metadata,
                        now,
                    );
                    self.apply_counted(&event).await?;
                }
                Err(e) => {
                    // Claim consumed, result unknown. The next scheduled
                    // offset still fires; we do not re-charge this one.
                    tracing::error!(
                        invoice_id = %invoice_id,
                        day_offset = offset,
                        error = %e,
                        "Invoice retry call failed"
                    );
                }
            }
        }
        Ok(())
    }

    async fn apply_counted(&self, event: &LifecycleEvent) -> AppResult<bool> {
        match self.lifecycle.apply_event(event).await? {
            ApplyOutcome::Applied { .. } => Ok(true),
            ApplyOutcome::Duplicate => Ok(false),
            ApplyOutcome::RejectedInvalid { .. } => Ok(false),
        }
    }
}

/// Candidate filter shared by the Postgres query and the in-memory store.
pub fn is_retry_candidate(sub: &Subscription) -> bool {
    sub.state == SubscriptionState::PastDue && sub.failing_invoice_id.is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::domain::entities::side_effect::SideEffect;
    use crate::test_utils::factories::create_test_subscription;
    use crate::test_utils::mocks::{
        InMemoryPersistence, RecordingHookRunner, ScriptedProcessorClient,
    };

    struct Harness {
        persistence: Arc<InMemoryPersistence>,
        hooks: Arc<RecordingHookRunner>,
        sweep: SweepUseCases,
    }

    fn harness(processor: ScriptedProcessorClient) -> Harness {
        let persistence = Arc::new(InMemoryPersistence::new());
        let hooks = Arc::new(RecordingHookRunner::new());
        let processor = Arc::new(processor);
        let lifecycle = LifecycleUseCases::new(
            persistence.clone(),
            persistence.clone(),
            persistence.clone(),
            hooks.clone(),
            processor.clone(),
            14,
            30,
            30,
        );
        let sweep = SweepUseCases::new(
            persistence.clone(),
            persistence.clone(),
            processor,
            lifecycle,
            7,
            30,
            vec![0, 3, 7],
            3,
            30,
        );
        Harness {
            persistence,
            hooks,
            sweep,
        }
    }

    #[tokio::test]
    async fn trial_ending_tomorrow_sends_exactly_one_notice() {
        let h = harness(ScriptedProcessorClient::ok());
        let now = Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.state = SubscriptionState::Trialing;
            s.trial_start = Some(now - Duration::days(13));
            s.trial_end = Some(now + Duration::days(1));
        });
        h.persistence.seed(sub.clone());

        let first = h.sweep.run_once(now).await;
        assert_eq!(first.trial_notices, 1);
        assert_eq!(first.trials_ended, 0);

        // Convergence: repeat runs before the clock moves are no-ops.
        let second = h.sweep.run_once(now).await;
        assert_eq!(second.trial_notices, 0);

        assert_eq!(
            h.hooks.recorded(),
            vec![SideEffect::SendTrialEndingNotice { days_before: 1 }]
        );
        assert_eq!(
            h.persistence.get(&sub.external_id).unwrap().state,
            SubscriptionState::Trialing
        );
    }

    #[tokio::test]
    async fn expired_trial_moves_to_past_due() {
        let h = harness(ScriptedProcessorClient::ok());
        let now = Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.state = SubscriptionState::Trialing;
            s.trial_start = Some(now - Duration::days(14));
            s.trial_end = Some(now - Duration::minutes(1));
        });
        h.persistence.seed(sub.clone());

        let report = h.sweep.run_once(now).await;
        assert_eq!(report.trials_ended, 1);
        assert_eq!(
            h.persistence.get(&sub.external_id).unwrap().state,
            SubscriptionState::PastDue
        );
    }

    #[tokio::test]
    async fn grace_period_expiry_moves_past_due_to_unpaid() {
        let h = harness(ScriptedProcessorClient::ok());
        let now = Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.state = SubscriptionState::PastDue;
            s.state_changed_at = now - Duration::days(8);
        });
        h.persistence.seed(sub.clone());

        let report = h.sweep.run_once(now).await;
        assert_eq!(report.grace_endings, 1);
        assert_eq!(
            h.persistence.get(&sub.external_id).unwrap().state,
            SubscriptionState::Unpaid
        );

        let again = h.sweep.run_once(now).await;
        assert_eq!(again.grace_endings, 0);
    }

    #[tokio::test]
    async fn fresh_past_due_is_left_alone_by_the_grace_scan() {
        let h = harness(ScriptedProcessorClient::ok());
        let now = Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.state = SubscriptionState::PastDue;
            s.state_changed_at = now - Duration::days(2);
        });
        h.persistence.seed(sub.clone());

        let report = h.sweep.run_once(now).await;
        assert_eq!(report.grace_endings, 0);
        assert_eq!(
            h.persistence.get(&sub.external_id).unwrap().state,
            SubscriptionState::PastDue
        );
    }

    #[tokio::test]
    async fn scheduled_cancellation_completes_when_the_period_ends() {
        let h = harness(ScriptedProcessorClient::ok());
        let now = Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.state = SubscriptionState::Canceling;
            s.cancel_at_period_end = true;
            s.current_period_end = now - Duration::hours(1);
        });
        h.persistence.seed(sub.clone());

        let report = h.sweep.run_once(now).await;
        assert_eq!(report.cancellations, 1);
        let stored = h.persistence.get(&sub.external_id).unwrap();
        assert_eq!(stored.state, SubscriptionState::Canceled);
        assert!(stored.canceled_at.is_some());
    }

    #[tokio::test]
    async fn stale_unpaid_subscription_expires() {
        let h = harness(ScriptedProcessorClient::ok());
        let now = Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.state = SubscriptionState::Unpaid;
            s.state_changed_at = now - Duration::days(31);
        });
        h.persistence.seed(sub.clone());

        let report = h.sweep.run_once(now).await;
        assert_eq!(report.expirations, 1);
        assert_eq!(
            h.persistence.get(&sub.external_id).unwrap().state,
            SubscriptionState::Expired
        );
    }

    #[tokio::test]
    async fn successful_retry_recovers_the_subscription() {
        let h = harness(ScriptedProcessorClient::retry_succeeds());
        let now = Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.state = SubscriptionState::PastDue;
            s.failing_invoice_id = Some("in_42".to_string());
            s.last_failure_at = Some(now - Duration::hours(1));
            s.retry_count = 0;
        });
        h.persistence.seed(sub.clone());

        let report = h.sweep.run_once(now).await;
        assert_eq!(report.retry_attempts, 1);

        let stored = h.persistence.get(&sub.external_id).unwrap();
        assert_eq!(stored.state, SubscriptionState::Active);
        assert_eq!(stored.retry_count, 0);
        assert_eq!(stored.failing_invoice_id, None);
    }

    #[tokio::test]
    async fn failed_retries_walk_the_schedule_and_exhaust() {
        let h = harness(ScriptedProcessorClient::retry_fails("card_declined"));
        let first_failure = Utc::now().naive_utc() - Duration::days(10);
        let sub = create_test_subscription(|s| {
            s.state = SubscriptionState::PastDue;
            s.failing_invoice_id = Some("in_43".to_string());
            s.last_failure_at = Some(first_failure);
            s.retry_count = 0;
        });
        h.persistence.seed(sub.clone());

        // Day 0, 3 and 7 attempts are all due; each tick takes one.
        for expected_count in 1..=3 {
            let report = h.sweep.run_once(Utc::now().naive_utc()).await;
            assert_eq!(report.retry_attempts, 1);
            let stored = h.persistence.get(&sub.external_id).unwrap();
            assert_eq!(stored.retry_count, expected_count);
            assert_eq!(stored.state, SubscriptionState::PastDue);
        }

        // Counter reached the maximum; the next pass notifies once.
        let report = h.sweep.run_once(Utc::now().naive_utc()).await;
        assert_eq!(report.retry_attempts, 0);
        assert_eq!(report.retries_exhausted, 1);
        assert!(h
            .hooks
            .recorded()
            .contains(&SideEffect::SendRetriesExhaustedNotice));

        let again = h.sweep.run_once(Utc::now().naive_utc()).await;
        assert_eq!(again.retries_exhausted, 0);
        assert_eq!(
            h.persistence.get(&sub.external_id).unwrap().state,
            SubscriptionState::PastDue
        );
    }

    #[tokio::test]
    async fn retry_cap_beyond_the_schedule_still_exhausts() {
        let persistence = Arc::new(InMemoryPersistence::new());
        let hooks = Arc::new(RecordingHookRunner::new());
        let processor = Arc::new(ScriptedProcessorClient::retry_fails("card_declined"));
        let lifecycle = LifecycleUseCases::new(
            persistence.clone(),
            persistence.clone(),
            persistence.clone(),
            hooks.clone(),
            processor.clone(),
            14,
            30,
            30,
        );
        // Cap misconfigured above the schedule length; the row must still
        // resolve instead of being skipped every tick.
        let sweep = SweepUseCases::new(
            persistence.clone(),
            persistence.clone(),
            processor,
            lifecycle,
            7,
            30,
            vec![0, 3, 7],
            5,
            30,
        );

        let now = Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.state = SubscriptionState::PastDue;
            s.failing_invoice_id = Some("in_45".to_string());
            s.last_failure_at = Some(now - Duration::days(10));
            s.retry_count = 3;
        });
        persistence.seed(sub.clone());

        let report = sweep.run_once(now).await;
        assert_eq!(report.retry_attempts, 0);
        assert_eq!(report.retries_exhausted, 1);
        assert!(hooks
            .recorded()
            .contains(&SideEffect::SendRetriesExhaustedNotice));
        assert_eq!(
            persistence.get(&sub.external_id).unwrap().state,
            SubscriptionState::PastDue
        );
    }

    #[tokio::test]
    async fn retry_attempt_is_claimed_exactly_once() {
        let h = harness(ScriptedProcessorClient::retry_fails("card_declined"));
        let now = Utc::now().naive_utc();
        let sub = create_test_subscription(|s| {
            s.state = SubscriptionState::PastDue;
            s.failing_invoice_id = Some("in_44".to_string());
            s.last_failure_at = Some(now - Duration::hours(1));
            s.retry_count = 0;
        });
        h.persistence.seed(sub.clone());

        h.sweep.run_once(now).await;
        // Same tick re-run: the day-0 claim already exists and day 3 is
        // not due yet.
        let report = h.sweep.run_once(now).await;
        assert_eq!(report.retry_attempts, 0);
        assert_eq!(h.persistence.get(&sub.external_id).unwrap().retry_count, 1);
    }
}
