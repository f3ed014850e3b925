use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::Value as JsonValue;
use uuid::Uuid;

use crate::domain::entities::subscription::SubscriptionState;

/// Append-only lifecycle history. Entries are never updated or deleted;
/// the log is the sole source for replaying a subscription's history.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub prior_state: SubscriptionState,
    pub new_state: SubscriptionState,
    pub event_kind: String,
    pub source: String,
    pub metadata: JsonValue,
    pub created_at: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub subscription_id: Uuid,
    pub prior_state: SubscriptionState,
    pub new_state: SubscriptionState,
    pub event_kind: String,
    pub source: String,
    pub metadata: JsonValue,
}
