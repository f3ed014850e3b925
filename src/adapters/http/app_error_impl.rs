use crate::app_error::{AppError, ErrorCode};
use axum::Json;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        // Log the error before it gets converted into a status response.
        tracing::error!(error = ?self, "Request failed");

        match self {
            AppError::Database(_) => {
                error_resp(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::DatabaseError, None)
            }
            AppError::StaleSignature => {
                error_resp(StatusCode::BAD_REQUEST, ErrorCode::StaleSignature, None)
            }
            AppError::InvalidSignature => {
                error_resp(StatusCode::UNAUTHORIZED, ErrorCode::InvalidSignature, None)
            }
            AppError::MalformedPayload(msg) => {
                error_resp(StatusCode::BAD_REQUEST, ErrorCode::MalformedPayload, Some(msg))
            }
            AppError::SubscriptionNotFound => {
                error_resp(StatusCode::NOT_FOUND, ErrorCode::SubscriptionNotFound, None)
            }
            // Internal retries already ran out; the caller redelivers.
            AppError::Conflict => {
                error_resp(StatusCode::SERVICE_UNAVAILABLE, ErrorCode::Conflict, None)
            }
            AppError::InvalidInput(msg) => {
                error_resp(StatusCode::BAD_REQUEST, ErrorCode::InvalidInput, Some(msg))
            }
            AppError::Internal(_) => {
                error_resp(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::InternalError, None)
            }
        }
    }
}

fn error_resp(status: StatusCode, code: ErrorCode, message: Option<String>) -> Response {
    let body = match message {
        Some(msg) => serde_json::json!({ "code": code.as_str(), "message": msg }),
        None => serde_json::json!({ "code": code.as_str() }),
    };
    (status, Json(body)).into_response()
}
