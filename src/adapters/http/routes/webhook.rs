//! Payment-processor webhook endpoint.

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
};
use serde_json::json;

use crate::{
    adapters::http::app_state::AppState,
    app_error::{AppError, AppResult},
    application::use_cases::{ingest::IngestOutcome, lifecycle::ApplyOutcome},
};

pub fn router() -> Router<AppState> {
    Router::new().route("/processor", post(handle_processor_webhook))
}

/// POST /api/webhooks/processor
///
/// A 2xx acknowledges the delivery; anything else makes the processor
/// redeliver. Duplicates, ignored event types and invalid transitions are
/// all acknowledged so redelivery stops.
async fn handle_processor_webhook(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> AppResult<impl IntoResponse> {
    let signature = headers
        .get("Processor-Signature")
        .and_then(|v| v.to_str().ok())
        .ok_or(AppError::InvalidSignature)?;

    let outcome = app_state.ingest_use_cases.ingest(&body, signature).await?;

    let status = match outcome {
        IngestOutcome::Processed(ApplyOutcome::Applied { .. }) => "applied",
        IngestOutcome::Processed(ApplyOutcome::Duplicate) => "duplicate",
        IngestOutcome::Processed(ApplyOutcome::RejectedInvalid { .. }) => "rejected",
        IngestOutcome::IgnoredUnknownType(_) => "ignored",
    };
    Ok(Json(json!({ "received": true, "status": status })))
}
