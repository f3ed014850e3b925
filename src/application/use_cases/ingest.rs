use chrono::{DateTime, NaiveDateTime, Utc};
use secrecy::SecretString;
use serde_json::Value as JsonValue;

use crate::{
    app_error::{AppError, AppResult},
    application::use_cases::lifecycle::{ApplyOutcome, LifecycleUseCases},
    domain::entities::lifecycle_event::{EventKind, LifecycleEvent},
    infra::signature,
};

/// How far a webhook timestamp may drift from our clock before the delivery
/// is refused as a replay.
pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Processed(ApplyOutcome),
    /// Event type we do not consume. Acknowledged so the processor stops
    /// redelivering it.
    IgnoredUnknownType(String),
}

/// Parsed webhook envelope. Everything else in the payload rides along in
/// `data` as event metadata.
struct Envelope {
    event_id: String,
    event_type: String,
    data: JsonValue,
    occurred_at: NaiveDateTime,
}

#[derive(Clone)]
pub struct IngestUseCases {
    lifecycle: LifecycleUseCases,
    webhook_secret: SecretString,
}

impl IngestUseCases {
    pub fn new(lifecycle: LifecycleUseCases, webhook_secret: SecretString) -> Self {
        Self {
            lifecycle,
            webhook_secret,
        }
    }

    /// Run one delivery through the hard gates, in order: timestamp
    /// freshness, signature, envelope shape, type mapping, normalization,
    /// engine. The first failing gate decides the response; nothing after
    /// a failed gate executes. Unknown event types pass the shape gate on
    /// `id`/`type`/`data` alone, so a payload we do not consume is always
    /// acknowledged rather than redelivered forever.
    pub async fn ingest(&self, raw_body: &str, signature_header: &str) -> AppResult<IngestOutcome> {
        signature::verify_signature(
            &self.webhook_secret,
            signature_header,
            raw_body,
            Utc::now().timestamp(),
            SIGNATURE_TOLERANCE_SECS,
        )?;

        let envelope = parse_envelope(raw_body)?;

        let Some(kind) = EventKind::from_external(&envelope.event_type) else {
            tracing::debug!(
                event_id = %envelope.event_id,
                event_type = %envelope.event_type,
                "Ignoring unconsumed webhook event type"
            );
            return Ok(IngestOutcome::IgnoredUnknownType(envelope.event_type));
        };

        // Only consumed kinds need a subscription reference.
        let subscription_external_id = envelope
            .data
            .get("subscription_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                AppError::MalformedPayload("missing data.subscription_id".to_string())
            })?
            .to_string();

        let event = LifecycleEvent::webhook(
            kind,
            subscription_external_id,
            &envelope.event_id,
            envelope.data,
            envelope.occurred_at,
        );
        let outcome = self.lifecycle.apply_event(&event).await?;
        Ok(IngestOutcome::Processed(outcome))
    }
}

fn parse_envelope(raw_body: &str) -> AppResult<Envelope> {
    let value: JsonValue = serde_json::from_str(raw_body)
        .map_err(|e| AppError::MalformedPayload(format!("invalid JSON: {e}")))?;

    let event_id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::MalformedPayload("missing event id".to_string()))?
        .to_string();
    let event_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::MalformedPayload("missing event type".to_string()))?
        .to_string();
    let data = value
        .get("data")
        .filter(|v| v.is_object())
        .cloned()
        .ok_or_else(|| AppError::MalformedPayload("missing data object".to_string()))?;

    let occurred_at = value
        .get("created")
        .and_then(|v| v.as_i64())
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.naive_utc())
        .unwrap_or_else(|| Utc::now().naive_utc());

    Ok(Envelope {
        event_id,
        event_type,
        data,
        occurred_at,
    })
}
