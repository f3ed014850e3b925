use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::{
    app_error::{AppError, AppResult},
    application::ports::payment_processor::{
        PaymentProcessorClient, ProcessorSubscription, RetryOutcome,
    },
};

const HTTP_TIMEOUT_SECS: u64 = 10;

/// HTTP adapter for the payment processor API.
#[derive(Clone)]
pub struct HttpProcessorClient {
    client: Client,
    base_url: String,
    api_key: SecretString,
}

#[derive(Deserialize)]
struct RetryResponse {
    paid: bool,
    failure_code: Option<String>,
}

#[derive(Deserialize)]
struct SubscriptionResponse {
    id: String,
    status: String,
    current_period_start: Option<i64>,
    current_period_end: Option<i64>,
}

impl HttpProcessorClient {
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

    fn auth_header(&self) -> String {
        format!("Bearer {}", self.api_key.expose_secret())
    }

    async fn handle_response<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> AppResult<T> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(AppError::SubscriptionNotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Internal(format!(
                "Processor returned {}: {}",
                status,
                crate::infra::error_snippet(&body)
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| AppError::Internal(format!("Processor response decode failed: {}", e)))
    }
}

#[async_trait]
impl PaymentProcessorClient for HttpProcessorClient {
    async fn retry_invoice(&self, invoice_id: &str) -> AppResult<RetryOutcome> {
        let response = self
            .client
            .post(format!("{}/invoices/{}/pay", self.base_url, invoice_id))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("Processor request failed: {}", e)))?;

        let body: RetryResponse = self.handle_response(response).await?;
        Ok(RetryOutcome {
            succeeded: body.paid,
            failure_code: body.failure_code,
        })
    }

    async fn get_subscription(&self, external_id: &str) -> AppResult<ProcessorSubscription> {
        let response = self
            .client
            .get(format!("{}/subscriptions/{}", self.base_url, external_id))
            .header("Authorization", self.auth_header())
            .send()
            .await
            .map_err(|e| AppError::Internal(format!("Processor request failed: {}", e)))?;

        let body: SubscriptionResponse = self.handle_response(response).await?;
        Ok(ProcessorSubscription {
            external_id: body.id,
            status: body.status,
            period_start: body.current_period_start,
            period_end: body.current_period_end,
        })
    }
}
