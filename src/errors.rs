use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Serialize;

use crate::admission::{AdmissionDecision, DecisionCause};

/// JSON error body returned to API clients.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g. "Too Many Requests")
    pub error: String,
    /// Human-readable description
    pub message: String,
    /// Machine-readable denial reason, present on 429s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DecisionCause>,
    /// Whole seconds until the caller may retry, present on 429s
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("rate limit exceeded")]
    RateLimited(AdmissionDecision),

    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::RateLimited(decision) => {
                let retry_after = decision.retry_after_secs();
                let message = match decision.reason {
                    Some(DecisionCause::BurstExceeded) => {
                        "Too many requests in a short burst. Slow down briefly and retry."
                    }
                    _ => "Request quota for this operation is spent for the current window.",
                };
                let body = ErrorResponse {
                    error: "Too Many Requests".to_string(),
                    message: message.to_string(),
                    reason: decision.reason,
                    retry_after_seconds: retry_after,
                    timestamp: Utc::now().to_rfc3339(),
                };

                let mut response = (StatusCode::TOO_MANY_REQUESTS, Json(body)).into_response();
                if let Some(secs) = retry_after {
                    if let Ok(value) = header::HeaderValue::from_str(&secs.to_string()) {
                        response.headers_mut().insert(header::RETRY_AFTER, value);
                    }
                }
                response
            }
            ApiError::Internal(message) => {
                let body = ErrorResponse {
                    error: "Internal Server Error".to_string(),
                    message,
                    reason: None,
                    retry_after_seconds: None,
                    timestamp: Utc::now().to_rfc3339(),
                };
                (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
            }
        }
    }
}
