use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Startup-time failures.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid configuration")]
    Config,
    #[error("Failed to start the server")]
    ServerStart,
}

/// Request-time failures, mapped onto the proxy's error taxonomy. Only
/// conditions detected before upstream headers are flushed become non-200
/// statuses; everything later rides inside the SSE stream.
#[derive(Debug)]
pub enum ApiError {
    /// Admission gate saturated. Never queues.
    TooBusy,
    Unauthorized,
    BadRequest(String),
    /// Dispatch failed terminally: retries exhausted, transport error, or
    /// deadline expiry before a live response.
    Upstream {
        details: String,
        performance_mode: &'static str,
    },
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::TooBusy => (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({"error": "Server too busy, please try again later"})),
            )
                .into_response(),
            ApiError::Unauthorized => (
                StatusCode::UNAUTHORIZED,
                Json(json!({"error": "Unauthorized"})),
            )
                .into_response(),
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, Json(json!({"error": message}))).into_response()
            }
            ApiError::Upstream {
                details,
                performance_mode,
            } => (
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "error": "Failed to get response from upstream",
                    "details": details,
                    "retry_after": 60,
                    "performance_mode": performance_mode,
                })),
            )
                .into_response(),
        }
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::TooBusy => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Upstream { .. } => StatusCode::BAD_GATEWAY,
        }
    }
}
