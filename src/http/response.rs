//! Default responses written by the middleware.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

/// JSON error envelope: `{"error": {"code": ..., "message": ...}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorDetail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub code: u16,
    pub message: String,
}

impl ErrorBody {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: status.as_u16(),
                message: message.into(),
            },
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(ErrorBody::new(status, message))).into_response()
}

/// The rejection sent when no custom handler is configured.
pub fn too_many_requests() -> Response {
    error_response(StatusCode::TOO_MANY_REQUESTS, "too many requests")
}

/// Sent when the external store fails during a decision.
pub fn store_unavailable() -> Response {
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "rate limit store unavailable",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_shape() {
        let body = ErrorBody::new(StatusCode::TOO_MANY_REQUESTS, "too many requests");
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "error": { "code": 429, "message": "too many requests" } })
        );
    }

    #[test]
    fn test_too_many_requests_status() {
        let response = too_many_requests();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()["content-type"], "application/json");
    }
}
