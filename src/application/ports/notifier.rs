use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::app_error::AppResult;

/// Outbound notification channel. Hooks render to a template name plus a
/// JSON payload; how the message is delivered is the adapter's business.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, template: &str, recipient: &str, data: JsonValue) -> AppResult<()>;
}
