use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "subscription_state", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Draft,
    PendingActivation,
    Trialing,
    Active,
    PastDue,
    Suspended,
    Unpaid,
    Canceling,
    Canceled,
    Reactivating,
    Error,
    Expired,
}

impl SubscriptionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionState::Draft => "draft",
            SubscriptionState::PendingActivation => "pending_activation",
            SubscriptionState::Trialing => "trialing",
            SubscriptionState::Active => "active",
            SubscriptionState::PastDue => "past_due",
            SubscriptionState::Suspended => "suspended",
            SubscriptionState::Unpaid => "unpaid",
            SubscriptionState::Canceling => "canceling",
            SubscriptionState::Canceled => "canceled",
            SubscriptionState::Reactivating => "reactivating",
            SubscriptionState::Error => "error",
            SubscriptionState::Expired => "expired",
        }
    }

    /// Terminal states have no outgoing transitions except explicit reactivation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionState::Canceled | SubscriptionState::Expired)
    }

    /// Returns true if the customer currently has access to paid features.
    pub fn is_billable(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Active | SubscriptionState::Trialing | SubscriptionState::PastDue
        )
    }
}

impl std::fmt::Display for SubscriptionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "billing_cycle", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Annual,
}

impl BillingCycle {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingCycle::Monthly => "monthly",
            BillingCycle::Annual => "annual",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "annual" | "yearly" | "year" => BillingCycle::Annual,
            _ => BillingCycle::Monthly,
        }
    }
}

/// Canonical subscription row. Only the repository mutates it, and only
/// through a transactional commit that also appends the audit entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub id: Uuid,
    /// Processor-assigned subscription id (unique).
    pub external_id: String,
    pub customer_email: String,
    pub plan_code: String,
    pub amount_cents: i64,
    pub currency: String,
    pub billing_cycle: BillingCycle,
    pub state: SubscriptionState,
    /// Updated only when the state value actually changes, so
    /// self-transitions do not reset grace-period or expiration clocks.
    pub state_changed_at: NaiveDateTime,
    pub current_period_start: NaiveDateTime,
    pub current_period_end: NaiveDateTime,
    pub trial_start: Option<NaiveDateTime>,
    pub trial_end: Option<NaiveDateTime>,
    pub cancel_at_period_end: bool,
    pub canceled_at: Option<NaiveDateTime>,
    pub cancellation_reason: Option<String>,
    pub paused_at: Option<NaiveDateTime>,
    pub pause_until: Option<NaiveDateTime>,
    /// Consecutive payment-retry attempts against the failing invoice.
    pub retry_count: i32,
    pub last_failure_at: Option<NaiveDateTime>,
    pub failing_invoice_id: Option<String>,
    pub created_at: Option<NaiveDateTime>,
    pub updated_at: Option<NaiveDateTime>,
}

impl Subscription {
    /// Billing-period sanity check. A row that fails this is corrupt and
    /// should be escalated rather than transitioned.
    pub fn period_is_valid(&self) -> bool {
        self.current_period_end >= self.current_period_start
    }
}
