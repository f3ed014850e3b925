use async_trait::async_trait;
use chrono::{NaiveDateTime, Utc};
use sqlx::Row;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::lifecycle::{
        CommitOutcome, NewSubscription, SubscriptionStore, TransitionCommit,
    },
    domain::entities::subscription::{Subscription, SubscriptionState},
};

fn row_to_subscription(row: &sqlx::postgres::PgRow) -> Subscription {
    Subscription {
        id: row.get("id"),
        external_id: row.get("external_id"),
        customer_email: row.get("customer_email"),
        plan_code: row.get("plan_code"),
        amount_cents: row.get("amount_cents"),
        currency: row.get("currency"),
        billing_cycle: row.get("billing_cycle"),
        state: row.get("state"),
        state_changed_at: row.get("state_changed_at"),
        current_period_start: row.get("current_period_start"),
        current_period_end: row.get("current_period_end"),
        trial_start: row.get("trial_start"),
        trial_end: row.get("trial_end"),
        cancel_at_period_end: row.get("cancel_at_period_end"),
        canceled_at: row.get("canceled_at"),
        cancellation_reason: row.get("cancellation_reason"),
        paused_at: row.get("paused_at"),
        pause_until: row.get("pause_until"),
        retry_count: row.get("retry_count"),
        last_failure_at: row.get("last_failure_at"),
        failing_invoice_id: row.get("failing_invoice_id"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

const SELECT_COLS: &str = r#"
    id, external_id, customer_email, plan_code, amount_cents, currency,
    billing_cycle, state, state_changed_at, current_period_start,
    current_period_end, trial_start, trial_end, cancel_at_period_end,
    canceled_at, cancellation_reason, paused_at, pause_until, retry_count,
    last_failure_at, failing_invoice_id, created_at, updated_at
"#;

#[async_trait]
impl SubscriptionStore for PostgresPersistence {
    async fn get_by_external_id(&self, external_id: &str) -> AppResult<Option<Subscription>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE external_id = $1",
            SELECT_COLS
        ))
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.as_ref().map(row_to_subscription))
    }

    async fn insert_draft(&self, new: NewSubscription) -> AppResult<Subscription> {
        // ON CONFLICT DO NOTHING plus re-select keeps redelivered creation
        // webhooks from failing on the unique external_id.
        sqlx::query(
            r#"
            INSERT INTO subscriptions (
                external_id, customer_email, plan_code, amount_cents, currency,
                billing_cycle, state, state_changed_at,
                current_period_start, current_period_end
            )
            VALUES ($1, $2, $3, $4, $5, $6, 'draft', NOW(), $7, $8)
            ON CONFLICT (external_id) DO NOTHING
            "#,
        )
        .bind(&new.external_id)
        .bind(&new.customer_email)
        .bind(&new.plan_code)
        .bind(new.amount_cents)
        .bind(&new.currency)
        .bind(new.billing_cycle)
        .bind(new.current_period_start)
        .bind(new.current_period_end)
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;

        self.get_by_external_id(&new.external_id)
            .await?
            .ok_or_else(|| AppError::Database("draft insert did not persist".to_string()))
    }

    async fn commit_transition(&self, commit: TransitionCommit) -> AppResult<CommitOutcome> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;

        // Claim the dedup key first. Losing this race means another
        // delivery already committed; the transaction rolls back on drop.
        if let Some(key) = &commit.dedup_key {
            let claimed = sqlx::query(
                r#"
                INSERT INTO processed_events (dedup_key, outcome, processed_at, expires_at)
                VALUES ($1, 'applied', NOW(), NOW() + make_interval(days => $2))
                ON CONFLICT (dedup_key) DO NOTHING
                "#,
            )
            .bind(key)
            .bind(commit.dedup_ttl_days as i32)
            .execute(&mut *tx)
            .await
            .map_err(AppError::from)?;
            if claimed.rows_affected() == 0 {
                return Ok(CommitOutcome::AlreadyProcessed);
            }
        }

        let row = sqlx::query(&format!(
            "SELECT {} FROM subscriptions WHERE id = $1 FOR UPDATE",
            SELECT_COLS
        ))
        .bind(commit.subscription_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(AppError::from)?
        .ok_or(AppError::SubscriptionNotFound)?;
        let current = row_to_subscription(&row);

        if current.state != commit.expected_state {
            return Ok(CommitOutcome::StateChanged(current.state));
        }

        let now = Utc::now().naive_utc();
        let mut updated = current.clone();
        commit.changes.apply(&mut updated);
        if updated.state != commit.new_state {
            updated.state_changed_at = now;
        }
        updated.state = commit.new_state;
        updated.updated_at = Some(now);

        sqlx::query(
            r#"
            UPDATE subscriptions SET
                state = $2,
                state_changed_at = $3,
                current_period_start = $4,
                current_period_end = $5,
                trial_start = $6,
                trial_end = $7,
                cancel_at_period_end = $8,
                canceled_at = $9,
                cancellation_reason = $10,
                paused_at = $11,
                pause_until = $12,
                retry_count = $13,
                last_failure_at = $14,
                failing_invoice_id = $15,
                updated_at = $16
            WHERE id = $1
            "#,
        )
        .bind(updated.id)
        .bind(updated.state)
        .bind(updated.state_changed_at)
        .bind(updated.current_period_start)
        .bind(updated.current_period_end)
        .bind(updated.trial_start)
        .bind(updated.trial_end)
        .bind(updated.cancel_at_period_end)
        .bind(updated.canceled_at)
        .bind(&updated.cancellation_reason)
        .bind(updated.paused_at)
        .bind(updated.pause_until)
        .bind(updated.retry_count)
        .bind(updated.last_failure_at)
        .bind(&updated.failing_invoice_id)
        .bind(updated.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;

        sqlx::query(
            r#"
            INSERT INTO audit_entries (
                subscription_id, prior_state, new_state, event_kind, source, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(commit.audit.subscription_id)
        .bind(commit.audit.prior_state)
        .bind(commit.audit.new_state)
        .bind(&commit.audit.event_kind)
        .bind(&commit.audit.source)
        .bind(&commit.audit.metadata)
        .execute(&mut *tx)
        .await
        .map_err(AppError::from)?;

        tx.commit().await.map_err(AppError::from)?;
        Ok(CommitOutcome::Committed(updated))
    }

    async fn find_trials_ending_before(
        &self,
        cutoff: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE state = 'trialing' AND trial_end IS NOT NULL AND trial_end <= $1
            ORDER BY trial_end ASC
            LIMIT $2
            "#,
            SELECT_COLS
        ))
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_subscription).collect())
    }

    async fn find_in_state_entered_before(
        &self,
        state: SubscriptionState,
        cutoff: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE state = $1 AND state_changed_at <= $2
            ORDER BY state_changed_at ASC
            LIMIT $3
            "#,
            SELECT_COLS
        ))
        .bind(state)
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_subscription).collect())
    }

    async fn find_cancellations_due(
        &self,
        now: NaiveDateTime,
        limit: i64,
    ) -> AppResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE state = 'canceling'
              AND (cancel_at_period_end = FALSE OR current_period_end <= $1)
            ORDER BY current_period_end ASC
            LIMIT $2
            "#,
            SELECT_COLS
        ))
        .bind(now)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_subscription).collect())
    }

    async fn find_retry_candidates(&self, limit: i64) -> AppResult<Vec<Subscription>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM subscriptions
            WHERE state = 'past_due' AND failing_invoice_id IS NOT NULL
            ORDER BY last_failure_at ASC NULLS LAST
            LIMIT $1
            "#,
            SELECT_COLS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_subscription).collect())
    }
}
