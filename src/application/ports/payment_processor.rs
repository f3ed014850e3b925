use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::app_error::AppResult;

/// Result of asking the processor to retry collection on a failing invoice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryOutcome {
    pub succeeded: bool,
    /// Processor-side decline or error code, when one was reported.
    pub failure_code: Option<String>,
}

/// Processor-side view of a subscription, used to verify a record before
/// reactivating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorSubscription {
    pub external_id: String,
    pub status: String,
    pub period_start: Option<i64>,
    pub period_end: Option<i64>,
}

/// Outbound port to the payment processor. The engine never talks to the
/// processor directly; retries and reactivation checks go through here.
#[async_trait]
pub trait PaymentProcessorClient: Send + Sync {
    async fn retry_invoice(&self, invoice_id: &str) -> AppResult<RetryOutcome>;

    async fn get_subscription(&self, external_id: &str) -> AppResult<ProcessorSubscription>;
}
