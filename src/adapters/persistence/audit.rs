use async_trait::async_trait;
use sqlx::Row;
use uuid::Uuid;

use crate::{
    adapters::persistence::PostgresPersistence,
    app_error::{AppError, AppResult},
    application::use_cases::lifecycle::AuditStore,
    domain::entities::audit::{AuditEntry, NewAuditEntry},
};

fn row_to_entry(row: &sqlx::postgres::PgRow) -> AuditEntry {
    AuditEntry {
        id: row.get("id"),
        subscription_id: row.get("subscription_id"),
        prior_state: row.get("prior_state"),
        new_state: row.get("new_state"),
        event_kind: row.get("event_kind"),
        source: row.get("source"),
        metadata: row.get("metadata"),
        created_at: row.get("created_at"),
    }
}

#[async_trait]
impl AuditStore for PostgresPersistence {
    async fn append(&self, entry: NewAuditEntry) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_entries (
                subscription_id, prior_state, new_state, event_kind, source, metadata
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(entry.subscription_id)
        .bind(entry.prior_state)
        .bind(entry.new_state)
        .bind(&entry.event_kind)
        .bind(&entry.source)
        .bind(&entry.metadata)
        .execute(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(())
    }

    async fn list_for_subscription(&self, subscription_id: Uuid) -> AppResult<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, subscription_id, prior_state, new_state, event_kind,
                   source, metadata, created_at
            FROM audit_entries
            WHERE subscription_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await
        .map_err(AppError::from)?;
        Ok(rows.iter().map(row_to_entry).collect())
    }
}
