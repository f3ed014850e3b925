use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::domain::entities::subscription::{BillingCycle, Subscription, SubscriptionState};

/// Build a plausible Active subscription and let the test override the
/// fields it cares about.
pub fn create_test_subscription(overrides: impl FnOnce(&mut Subscription)) -> Subscription {
    let now = Utc::now().naive_utc();
    let mut subscription = Subscription {
        id: Uuid::new_v4(),
        external_id: format!("sub_{}", Uuid::new_v4().simple()),
        customer_email: "customer@example.com".to_string(),
        plan_code: "basic".to_string(),
        amount_cents: 999,
        currency: "usd".to_string(),
        billing_cycle: BillingCycle::Monthly,
        state: SubscriptionState::Active,
        state_changed_at: now,
        current_period_start: now - Duration::days(10),
        current_period_end: now + Duration::days(20),
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
    overrides(&mut subscription);
    subscription
}
