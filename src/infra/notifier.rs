use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value as JsonValue};

use crate::{
    app_error::{AppError, AppResult},
    application::ports::notifier::Notifier,
};

const HTTP_TIMEOUT_SECS: u64 = 10;

/// HTTP adapter for the notification channel. One endpoint, template plus
/// payload; the channel decides how the message reaches the customer.
#[derive(Clone)]
pub struct HttpNotifier {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

impl HttpNotifier {
    pub fn new(base_url: String, api_key: SecretString) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .expect("failed to build reqwest client");
        Self {
            client,
            base_url,
            api_key,
        }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn send(&self, template: &str, recipient: &str, data: JsonValue) -> AppResult<()> {
        let response = self
            .client
            .post(format!("{}/messages", self.base_url))
            .header(
                "Authorization",
                format!("Bearer {}", self.api_key.expose_secret()),
            )
            .json(&json!({
                "template": template,
                "to": recipient,
                "data": data,
            }))
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("Notifier request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Internal(format!(
                "Notifier returned {}: {}",
                status,
                crate::infra::error_snippet(&body)
            )));
        }
        Ok(())
    }
}
