use async_trait::async_trait;
use chrono::NaiveDateTime;
use sqlx::Row;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::lifecycle::IdempotencyStore,
};

#[async_trait]
impl IdempotencyStore for PostgresPersistence {
    async fn is_processed(&self, dedup_key: &str) -> AppResult<bool> {
        let row = sqlx::query("SELECT 1 AS present FROM processed_events WHERE dedup_key = $1")
            .bind(dedup_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(AppError::from)?;
        Ok(row.is_some())
    }

    async fn record(&self, dedup_key: &str, outcome: &str, ttl_days: i64) -> AppResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_events (dedup_key, outcome, processed_at, expires_at)
            VALUES ($1, $2, NOW(), NOW() + make_interval(days => $3))
            ON CONFLICT (dedup_key) DO NOTHING
            "#,
        )
        .bind(dedup_key)
        .bind(outcome)
        .bind(ttl_days as i32)
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(result.rows_affected() > 0)
    }

    async fn purge_expired(&self, now: NaiveDateTime) -> AppResult<u64> {
        let row = sqlx::query(
            r#"
            WITH purged AS (
                DELETE FROM processed_events WHERE expires_at <= $1 RETURNING 1
            )
            SELECT COUNT(*) AS purged_count FROM purged
            "#,
        )
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(row.get::<i64, _>("purged_count") as u64)
    }
}
