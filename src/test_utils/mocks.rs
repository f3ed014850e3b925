use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{Duration, NaiveDateTime, Utc};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::{
    app_error::{AppError, AppResult},
    application::{
        ports::{
            notifier::Notifier,
            payment_processor::{PaymentProcessorClient, ProcessorSubscription, RetryOutcome},
        },
        use_cases::lifecycle::{
            AuditStore, CommitOutcome, HookRunner, IdempotencyStore, NewSubscription,
            SubscriptionStore, TransitionCommit,
        },
        use_cases::sweep::is_retry_candidate,
    },
    domain::entities::{
        audit::{AuditEntry, NewAuditEntry},
        side_effect::SideEffect,
        subscription::{Subscription, SubscriptionState},
    },
};

#[derive(Default)]
struct PersistenceInner {
    subscriptions: HashMap<String, Subscription>,
    audit: Vec<AuditEntry>,
    processed: HashMap<String, NaiveDateTime>,
}

/// One in-memory stand-in for all three Postgres-backed stores, with the
/// same commit semantics: state recheck under the lock, dedup insert and
/// audit append atomic with the state write.
#[derive(Default)]
pub struct InMemoryPersistence {
    inner: Mutex<PersistenceInner>,
}

impl InMemoryPersistence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, subscription: Subscription) {
        let mut inner = self.inner.lock().unwrap();
        inner
            .subscriptions
            .insert(subscription.external_id.clone(), subscription);
    }

    pub fn get(&self, external_id: &str) -> Option<Subscription> {
        self.inner
            .lock()
            .unwrap()
            .subscriptions
            .get(external_id)
            .cloned()
    }

    pub fn audit_entries(&self, subscription_id: Uuid) -> Vec<AuditEntry> {
        self.inner
            .lock()
            .unwrap()
            .audit
            .iter()
            .filter(|e| e.subscription_id == subscription_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl SubscriptionStore for InMemoryPersistence {
    async fn get_by_external_id(&self, external_id: &str) -> AppResult<Option<Subscription>> {
        Ok(self.get(external_id))
    }

    async fn insert_draft(&self, new: NewSubscription) -> AppResult<Subscription> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.subscriptions.get(&new.external_id) {
            return Ok(existing.clone());
        }
        let now = Utc::now().naive_utc();
        let subscription = Subscription {
            id: Uuid::new_v4(),
            external_id: new.external_id.clone(),
            customer_email: new.customer_email,
            plan_code: new.plan_code,
            amount_cents: new.amount_cents,
            currency: new.currency,
            billing_cycle: new.billing_cycle,
            state: SubscriptionState::Draft,
            state_changed_at: now,
            current_period_start: new.current_period_start,
            current_period_end: new.current_period_end,
            trial_start: None,
            trial_end: None,
            cancel_at_period_end: false,
            canceled_at: None,
            cancellation_reason: None,
            paused_at: None,
            pause_until: None,
            retry_count: 0,
            last_failure_at: None,
            failing_invoice_id: None,
            created_at: Some(now),
            updated_at: Some(now),
        };
        inner
            .subscriptions
            .insert(new.external_id, subscription.clone());
        Ok(subscription)
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> AppResult<CommitOutcome> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(key) = &commit.dedup_key {
            if inner.processed.contains_key(key) {
                return Ok(CommitOutcome::AlreadyProcessed);
            }
        }

        let subscription = inner
            .subscriptions
            .values_mut()
            .find(|s| s.id == commit.subscription_id)
            .ok_or(AppError::SubscriptionNotFound)?;

        if subscription.state != commit.expected_state {
            return Ok(CommitOutcome::StateChanged(subscription.state));
        }

        let now = Utc::now().naive_utc();
        commit.changes.apply(subscription);
        if subscription.state != commit.new_state {
            subscription.state_changed_at = now;
        }
        subscription.state = commit.new_state;
        subscription.updated_at = Some(now);
        let updated = subscription.clone();

        inner.audit.push(AuditEntry {
            id: Uuid::new_v4(),
            subscription_id: commit.audit.subscription_id,
            prior_state: commit.audit.prior_state,
            new_state: commit.audit.new_state,
            event_kind: commit.audit.event_kind,
            source: commit.audit.source,
            metadata: commit.audit.metadata,
            created_at: Some(now),
        });
        if let Some(key) = commit.dedup_key {
            inner
                .processed
                .insert(key, now + Duration::days(commit.dedup_ttl_days));
        }

        Ok(CommitOutcome::Committed(updated))
    }

    async fn find_trials_ending_before(
        &self,
        cutoff: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Subscription>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| {
                s.state == SubscriptionState::Trialing
                    && s.trial_end.map(|te| te <= cutoff).unwrap_or(false)
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn find_in_state_entered_before(
        &self,
        state: SubscriptionState,
        cutoff: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Subscription>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| s.state == state && s.state_changed_at <= cutoff)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn find_cancellations_due(
        &self,
        now: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Subscription>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| {
                s.state == SubscriptionState::Canceling
                    && (!s.cancel_at_period_end || s.current_period_end <= now)
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn find_retry_candidates(&self, limit: i64) -> AppResult<Vec<Subscription>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .subscriptions
            .values()
            .filter(|s| is_retry_candidate(s))
            .take(limit as usize)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryPersistence {
    async fn is_processed(&self, dedup_key: &str) -> AppResult<bool> {
        Ok(self.inner.lock().unwrap().processed.contains_key(dedup_key))
    }

    async fn record(&self, dedup_key: &str, _outcome: &str, ttl_days: i64) -> AppResult<bool> {
        let mut inner = self.inner.lock().unwrap();
        if inner.processed.contains_key(dedup_key) {
            return Ok(false);
        }
        inner.processed.insert(
            dedup_key.to_string(),
            Utc::now().naive_utc() + Duration::days(ttl_days),
        );
        Ok(true)
    }

    async fn purge_expired(&self, now: NaiveDateTime) -> AppResult<u64> {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.processed.len();
        inner.processed.retain(|_, expires_at| *expires_at > now);
        Ok((before - inner.processed.len()) as u64)
    }
}

#[async_trait]
impl AuditStore for InMemoryPersistence {
    async fn append(&self, entry: NewAuditEntry) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.audit.push(AuditEntry {
            id: Uuid::new_v4(),
            subscription_id: entry.subscription_id,
            prior_state: entry.prior_state,
            new_state: entry.new_state,
            event_kind: entry.event_kind,
            source: entry.source,
            metadata: entry.metadata,
            created_at: Some(Utc::now().naive_utc()),
        });
        Ok(())
    }

    async fn list_for_subscription(&self, subscription_id: Uuid) -> AppResult<Vec<AuditEntry>> {
        Ok(self.audit_entries(subscription_id))
    }
}

/// Records side effects instead of delivering them.
#[derive(Default)]
pub struct RecordingHookRunner {
    effects: Mutex<Vec<SideEffect>>,
}

impl RecordingHookRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recorded(&self) -> Vec<SideEffect> {
        self.effects.lock().unwrap().clone()
    }
}

#[async_trait]
impl HookRunner for RecordingHookRunner {
    async fn run(&self, _subscription: &Subscription, effects: &[SideEffect]) {
        self.effects.lock().unwrap().extend_from_slice(effects);
    }
}

/// Records notifications instead of sending them. Can be scripted to fail
/// the first N sends to exercise retry paths.
#[derive(Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(String, String, JsonValue)>>,
    failures_remaining: Mutex<u32>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(n: u32) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            failures_remaining: Mutex::new(n),
        }
    }

    pub fn sent(&self) -> Vec<(String, String, JsonValue)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(&self, template: &str, recipient: &str, data: JsonValue) -> AppResult<()> {
        {
            let mut remaining = self.failures_remaining.lock().unwrap();
            if *remaining > 0 {
                *remaining -= 1;
                return Err(AppError::Internal("notifier unavailable".to_string()));
            }
        }
        self.sent
            .lock()
            .unwrap()
            .push((template.to_string(), recipient.to_string(), data));
        Ok(())
    }
}

/// Payment processor double with a fixed script.
pub struct ScriptedProcessorClient {
    subscription_status: String,
    retry_succeeds: bool,
    failure_code: Option<String>,
}

impl ScriptedProcessorClient {
    pub fn ok() -> Self {
        Self::with_status("active")
    }

    pub fn with_status(status: &str) -> Self {
        Self {
            subscription_status: status.to_string(),
            retry_succeeds: true,
            failure_code: None,
        }
    }

    pub fn retry_succeeds() -> Self {
        Self::ok()
    }

    pub fn retry_fails(code: &str) -> Self {
        Self {
            subscription_status: "past_due".to_string(),
            retry_succeeds: false,
            failure_code: Some(code.to_string()),
        }
    }
}

#[async_trait]
impl PaymentProcessorClient for ScriptedProcessorClient {
    async fn retry_invoice(&self, _invoice_id: &str) -> AppResult<RetryOutcome> {
        Ok(RetryOutcome {
            succeeded: self.retry_succeeds,
            failure_code: self.failure_code.clone(),
        })
    }

    async fn get_subscription(&self, external_id: &str) -> AppResult<ProcessorSubscription> {
        let now = Utc::now();
        Ok(ProcessorSubscription {
            external_id: external_id.to_string(),
            status: self.subscription_status.clone(),
            period_start: Some(now.timestamp()),
            period_end: Some((now + Duration::days(30)).timestamp()),
        })
    }
}
