use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::ports::payment_processor::PaymentProcessorClient,
    domain::{
        entities::{
            audit::{AuditEntry, NewAuditEntry},
            lifecycle_event::{EventKind, LifecycleEvent},
            side_effect::SideEffect,
            subscription::{BillingCycle, Subscription, SubscriptionState},
        },
        state_machine::{self, FieldChanges},
    },
};

/// Lost-row-race recomputes before giving up with Conflict.
const MAX_COMMIT_RETRIES: u32 = 3;

/// Seed row created when a SubscriptionCreated event arrives for an unknown
/// external id.
#[derive(Debug, Clone)]
pub struct NewSubscription {
    pub external_id: String,
    pub customer_email: String,
    pub plan_code: String,
    pub amount_cents: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub current_period_start: NaiveDateTime,
    pub current_period_end: NaiveDateTime,
}

/// Everything the repository needs to commit one transition atomically:
/// the state write, the field changes, the audit entry, and the idempotency
/// record all land in one transaction or none of them do.
#[derive(Debug, Clone)]
pub struct TransitionCommit {
    pub subscription_id: Uuid,
    /// State the plan was computed against. The commit re-reads the row
    /// under lock and bails with StateChanged if this no longer holds.
    pub expected_state: SubscriptionState,
    pub new_state: SubscriptionState,
    pub changes: FieldChanges,
    pub audit: NewAuditEntry,
    pub dedup_key: Option<String>,
    pub dedup_ttl_days: i64,
}

#[derive(Debug, Clone)]
pub enum CommitOutcome {
    /// The transition landed; carries the post-commit row.
    Committed(Subscription),
    /// Another writer moved the row first; carries the state it is in now.
    StateChanged(SubscriptionState),
    /// The dedup key was already recorded by an earlier delivery.
    AlreadyProcessed,
}

/// How an event application resolved. Only `Applied` changed anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied {
        prior_state: SubscriptionState,
        new_state: SubscriptionState,
    },
    /// Dedup key already recorded; acknowledged without reapplying.
    Duplicate,
    /// The transition table rejects (state, kind); recorded as an anomaly
    /// and acknowledged.
    RejectedInvalid {
        state: SubscriptionState,
        event: EventKind,
    },
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_by_external_id(&self, external_id: &str) -> AppResult<Option<Subscription>>;

    /// Insert a Draft row, or return the existing row when the external id
    /// is already known (redelivered creation webhook).
    async fn insert_draft(&self, new: NewSubscription) -> AppResult<Subscription>;

    async fn commit_transition(&self, commit: TransitionCommit) -> AppResult<CommitOutcome>;

    /// Trialing rows whose trial_end falls before the cutoff.
    async fn find_trials_ending_before(
        &self,
        cutoff: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Subscription>>;

    /// Rows in `state` whose last transition is older than the cutoff.
    async fn find_in_state_entered_before(
        &self,
        state: SubscriptionState,
        cutoff: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Subscription>>;

    /// Canceling rows whose scheduled completion is due: either immediate
    /// cancellations or period-end ones whose period has elapsed.
    async fn find_cancellations_due(
        &self,
        now: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Subscription>>;

    /// PastDue rows carrying a failing invoice, the retry workflow's input.
    async fn find_retry_candidates(&self, limit: i64) -> AppResult<Vec<Subscription>>;
}

#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    async fn is_processed(&self, dedup_key: &str) -> AppResult<bool>;

    /// Atomic insert-if-absent. Returns true when this caller claimed the
    /// key, false when an earlier caller already holds it.
    async fn record(&self, dedup_key: &str, outcome: &str, ttl_days: i64) -> AppResult<bool>;

    async fn purge_expired(&self, now: NaiveDateTime) -> AppResult<u64>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: NewAuditEntry) -> AppResult<()>;

    async fn list_for_subscription(&self, subscription_id: Uuid) -> AppResult<Vec<AuditEntry>>;
}

/// Post-commit side-effect interpreter. Implementations own their retry
/// policy and must neither propagate failure back into the request nor
/// block it while they deliver.
#[async_trait]
pub trait HookRunner: Send + Sync {
    async fn run(&self, subscription: &Subscription, effects: &[SideEffect]);
}

#[derive(Clone)]
pub struct LifecycleUseCases {
    store: Arc<dyn SubscriptionStore>,
    idempotency: Arc<dyn IdempotencyStore>,
    audit: Arc<dyn AuditStore>,
    hooks: Arc<dyn HookRunner>,
    processor: Arc<dyn PaymentProcessorClient>,
    default_trial_days: i64,
    idempotency_retention_days: i64,
    reactivation_window_days: i64,
}

impl LifecycleUseCases {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn SubscriptionStore>,
        idempotency: Arc<dyn IdempotencyStore>,
        audit: Arc<dyn AuditStore>,
        hooks: Arc<dyn HookRunner>,
        processor: Arc<dyn PaymentProcessorClient>,
        default_trial_days: i64,
        idempotency_retention_days: i64,
        reactivation_window_days: i64,
    ) -> Self {
        Self {
            store,
            idempotency,
            audit,
            hooks,
            processor,
            default_trial_days,
            idempotency_retention_days,
            reactivation_window_days,
        }
    }

    /// Apply one lifecycle event. The single entry point for webhook, sweep
    /// and manual sources; all serialization and dedup guarantees live here
    /// and in the transactional commit beneath it.
    pub async fn apply_event(&self, event: &LifecycleEvent) -> AppResult<ApplyOutcome> {
        if let Some(key) = &event.dedup_key {
            if self.idempotency.is_processed(key).await? {
                tracing::debug!(dedup_key = %key, "Event already processed, skipping");
                return Ok(ApplyOutcome::Duplicate);
            }
        }

        let mut subscription = self.load_or_seed(event).await?;

        // A row that violates its own invariants is escalated to the error
        // state first; the triggering event is then planned against it.
        if event.kind != EventKind::AnomalyDetected
            && subscription.state != SubscriptionState::Error
            && !subscription.period_is_valid()
        {
            if let Some(escalated) = self.escalate_corrupt_row(&subscription, event).await? {
                subscription = escalated;
            }
        }

        for _ in 0..MAX_COMMIT_RETRIES {
            let mut plan = match state_machine::plan(&subscription, event) {
                Ok(plan) => plan,
                Err(invalid) => {
                    return self.record_anomaly(&subscription, event, invalid).await;
                }
            };
            if event.kind == EventKind::TrialStarted && plan.changes.set_trial.is_none() {
                plan.changes.set_trial = Some((
                    event.occurred_at,
                    event.occurred_at + Duration::days(self.default_trial_days),
                ));
            }

            let commit = TransitionCommit {
                subscription_id: subscription.id,
                expected_state: subscription.state,
                new_state: plan.new_state,
                changes: plan.changes.clone(),
                audit: NewAuditEntry {
                    subscription_id: subscription.id,
                    prior_state: subscription.state,
                    new_state: plan.new_state,
                    event_kind: event.kind.as_str().to_string(),
                    source: event.source.as_str().to_string(),
                    metadata: event.metadata.clone(),
                },
                dedup_key: event.dedup_key.clone(),
                dedup_ttl_days: self.idempotency_retention_days,
            };

            match self.store.commit_transition(commit).await? {
                CommitOutcome::Committed(updated) => {
                    tracing::info!(
                        subscription_id = %updated.id,
                        event = %event.kind,
                        from = %subscription.state,
                        to = %updated.state,
                        source = event.source.as_str(),
                        "Transition committed"
                    );
                    let prior_state = subscription.state;
                    let new_state = updated.state;
                    self.hooks.run(&updated, &plan.side_effects).await;
                    return Ok(ApplyOutcome::Applied {
                        prior_state,
                        new_state,
                    });
                }
                CommitOutcome::StateChanged(current) => {
                    tracing::debug!(
                        subscription_id = %subscription.id,
                        expected = %subscription.state,
                        actual = %current,
                        "Lost row race, recomputing transition"
                    );
                    subscription = self
                        .store
                        .get_by_external_id(&event.subscription_external_id)
                        .await?
                        .ok_or(AppError::SubscriptionNotFound)?;
                }
                CommitOutcome::AlreadyProcessed => {
                    return Ok(ApplyOutcome::Duplicate);
                }
            }
        }

        Err(AppError::Conflict)
    }

    async fn load_or_seed(&self, event: &LifecycleEvent) -> AppResult<Subscription> {
        if let Some(existing) = self
            .store
            .get_by_external_id(&event.subscription_external_id)
            .await?
        {
            return Ok(existing);
        }
        if event.kind != EventKind::SubscriptionCreated {
            return Err(AppError::SubscriptionNotFound);
        }
        self.store
            .insert_draft(seed_from_metadata(event)?)
            .await
    }

    /// Invalid (state, kind) pairs are anomalies, not failures: the row is
    /// left untouched, the rejection lands in the audit log, and the dedup
    /// key is recorded so a redelivery does not re-log it.
    async fn record_anomaly(
        &self,
        subscription: &Subscription,
        event: &LifecycleEvent,
        invalid: state_machine::InvalidTransition,
    ) -> AppResult<ApplyOutcome> {
        tracing::warn!(
            subscription_id = %subscription.id,
            state = %invalid.from,
            event = %invalid.event,
            source = event.source.as_str(),
            "Invalid transition rejected"
        );
        self.audit
            .append(NewAuditEntry {
                subscription_id: subscription.id,
                prior_state: subscription.state,
                new_state: subscription.state,
                event_kind: event.kind.as_str().to_string(),
                source: event.source.as_str().to_string(),
                metadata: json!({
                    "rejected": true,
                    "reason": invalid.to_string(),
                    "event_metadata": event.metadata,
                }),
            })
            .await?;
        if let Some(key) = &event.dedup_key {
            self.idempotency
                .record(key, "rejected", self.idempotency_retention_days)
                .await?;
        }
        Ok(ApplyOutcome::RejectedInvalid {
            state: invalid.from,
            event: invalid.event,
        })
    }

    /// Corrupt rows (inverted billing period) go to the error state rather
    /// than being transitioned as if healthy. The escalation carries no
    /// dedup key: it fires on whatever event surfaces the corruption.
    async fn escalate_corrupt_row(
        &self,
        subscription: &Subscription,
        trigger: &LifecycleEvent,
    ) -> AppResult<Option<Subscription>> {
        tracing::error!(
            subscription_id = %subscription.id,
            state = %subscription.state,
            period_start = %subscription.current_period_start,
            period_end = %subscription.current_period_end,
            "Billing period inverted, escalating to error state"
        );
        let escalation = LifecycleEvent {
            kind: EventKind::AnomalyDetected,
            subscription_external_id: subscription.external_id.clone(),
            source: trigger.source,
            dedup_key: None,
            metadata: json!({
                "reason": "billing period inverted",
                "period_start": subscription.current_period_start.and_utc().timestamp(),
                "period_end": subscription.current_period_end.and_utc().timestamp(),
                "trigger_event": trigger.kind.as_str(),
            }),
            occurred_at: trigger.occurred_at,
        };
        let plan = match state_machine::plan(subscription, &escalation) {
            Ok(plan) => plan,
            // Terminal rows have nowhere to escalate to.
            Err(_) => return Ok(None),
        };
        let commit = TransitionCommit {
            subscription_id: subscription.id,
            expected_state: subscription.state,
            new_state: plan.new_state,
            changes: plan.changes,
            audit: NewAuditEntry {
                subscription_id: subscription.id,
                prior_state: subscription.state,
                new_state: plan.new_state,
                event_kind: escalation.kind.as_str().to_string(),
                source: escalation.source.as_str().to_string(),
                metadata: escalation.metadata.clone(),
            },
            dedup_key: None,
            dedup_ttl_days: self.idempotency_retention_days,
        };
        match self.store.commit_transition(commit).await? {
            CommitOutcome::Committed(updated) => Ok(Some(updated)),
            CommitOutcome::StateChanged(_) | CommitOutcome::AlreadyProcessed => {
                self.store
                    .get_by_external_id(&subscription.external_id)
                    .await
            }
        }
    }

    pub async fn history(&self, external_id: &str) -> AppResult<Vec<AuditEntry>> {
        let subscription = self
            .store
            .get_by_external_id(external_id)
            .await?
            .ok_or(AppError::SubscriptionNotFound)?;
        self.audit.list_for_subscription(subscription.id).await
    }

    pub async fn get(&self, external_id: &str) -> AppResult<Subscription> {
        self.store
            .get_by_external_id(external_id)
            .await?
            .ok_or(AppError::SubscriptionNotFound)
    }

    /// Operator-initiated cancellation. Immediate cancellations complete in
    /// the same call; period-end cancellations park in Canceling until the
    /// sweep sees the period elapse.
    pub async fn request_cancellation(
        &self,
        external_id: &str,
        reason: Option<String>,
        at_period_end: bool,
    ) -> AppResult<ApplyOutcome> {
        let now = Utc::now().naive_utc();
        let request = LifecycleEvent::manual(
            EventKind::CancellationRequested,
            external_id,
            json!({ "reason": reason, "at_period_end": at_period_end }),
            now,
        );
        let outcome = self.apply_event(&request).await?;
        if at_period_end || !matches!(outcome, ApplyOutcome::Applied { .. }) {
            return Ok(outcome);
        }
        let complete = LifecycleEvent::manual(
            EventKind::CancellationCompleted,
            external_id,
            json!({ "reason": reason }),
            now,
        );
        self.apply_event(&complete).await
    }

    pub async fn revoke_cancellation(&self, external_id: &str) -> AppResult<ApplyOutcome> {
        let event = LifecycleEvent::manual(
            EventKind::CancellationRevoked,
            external_id,
            json!({}),
            Utc::now().naive_utc(),
        );
        self.apply_event(&event).await
    }

    pub async fn pause(
        &self,
        external_id: &str,
        pause_until: Option<NaiveDateTime>,
    ) -> AppResult<ApplyOutcome> {
        let event = LifecycleEvent::manual(
            EventKind::PauseRequested,
            external_id,
            json!({ "pause_until": pause_until.map(|t| t.and_utc().timestamp()) }),
            Utc::now().naive_utc(),
        );
        self.apply_event(&event).await
    }

    pub async fn resume(&self, external_id: &str) -> AppResult<ApplyOutcome> {
        let event = LifecycleEvent::manual(
            EventKind::ResumeRequested,
            external_id,
            json!({}),
            Utc::now().naive_utc(),
        );
        self.apply_event(&event).await
    }

    /// Reactivate a canceled subscription. Enforces the reactivation window
    /// against `canceled_at`, then settles Reactivating into Completed or
    /// Failed based on what the processor reports for the record.
    pub async fn request_reactivation(&self, external_id: &str) -> AppResult<ApplyOutcome> {
        let now = Utc::now().naive_utc();
        let subscription = self.get(external_id).await?;

        if subscription.state == SubscriptionState::Canceled {
            let window = Duration::days(self.reactivation_window_days);
            let expired = subscription
                .canceled_at
                .map(|at| now - at > window)
                .unwrap_or(false);
            if expired {
                return Err(AppError::InvalidInput(format!(
                    "reactivation window of {} days has passed",
                    self.reactivation_window_days
                )));
            }
        }

        let request =
            LifecycleEvent::manual(EventKind::ReactivationRequested, external_id, json!({}), now);
        let outcome = self.apply_event(&request).await?;
        if !matches!(outcome, ApplyOutcome::Applied { .. }) {
            return Ok(outcome);
        }

        match self.processor.get_subscription(external_id).await {
            Ok(remote) if matches!(remote.status.as_str(), "active" | "trialing") => {
                let settle = LifecycleEvent::manual(
                    EventKind::ReactivationCompleted,
                    external_id,
                    json!({
                        "period_start": remote.period_start,
                        "period_end": remote.period_end,
                    }),
                    now,
                );
                self.apply_event(&settle).await
            }
            Ok(remote) => {
                let settle = LifecycleEvent::manual(
                    EventKind::ReactivationFailed,
                    external_id,
                    json!({ "processor_status": remote.status }),
                    now,
                );
                self.apply_event(&settle).await
            }
            Err(e) => {
                tracing::error!(external_id = %external_id, error = %e, "Processor lookup failed during reactivation");
                let settle = LifecycleEvent::manual(
                    EventKind::ReactivationFailed,
                    external_id,
                    json!({ "error": e.to_string() }),
                    now,
                );
                self.apply_event(&settle).await
            }
        }
    }

    pub async fn escalate_anomaly(
        &self,
        external_id: &str,
        reason: &str,
    ) -> AppResult<ApplyOutcome> {
        let event = LifecycleEvent::manual(
            EventKind::AnomalyDetected,
            external_id,
            json!({ "reason": reason }),
            Utc::now().naive_utc(),
        );
        self.apply_event(&event).await
    }
}

fn seed_from_metadata(event: &LifecycleEvent) -> AppResult<NewSubscription> {
    let meta = &event.metadata;
    let customer_email = meta
        .get("customer_email")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::MalformedPayload("missing customer_email".to_string()))?;
    let plan_code = meta
        .get("plan_code")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::MalformedPayload("missing plan_code".to_string()))?;

    let period_start = meta
        .get("period_start")
        .and_then(|v| v.as_i64())
        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|dt| dt.naive_utc())
        .unwrap_or(event.occurred_at);
    let period_end = meta
        .get("period_end")
        .and_then(|v| v.as_i64())
        .and_then(|s| chrono::DateTime::from_timestamp(s, 0))
        .map(|dt| dt.naive_utc())
        .unwrap_or(period_start + Duration::days(30));

    Ok(NewSubscription {
        external_id: event.subscription_external_id.clone(),
        customer_email: customer_email.to_string(),
        plan_code: plan_code.to_string(),
        amount_cents: meta.get("amount_cents").and_then(|v| v.as_i64()).unwrap_or(0),
        currency: meta
            .get("currency")
            .and_then(|v| v.as_str())
            .unwrap_or("usd")
            .to_string(),
        billing_cycle: meta
            .get("billing_cycle")
            .and_then(|v| v.as_str())
            .map(BillingCycle::from_str)
            .unwrap_or(BillingCycle::Monthly),
        current_period_start: period_start,
        current_period_end: period_end,
    })
}
