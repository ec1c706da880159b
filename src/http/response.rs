//! JSON envelope for rejected requests.

use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::RateLimitViolation;

/// Body returned with a 429 or 503 response.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectionBody {
    pub status: u16,
    pub message: String,
    pub code: &'static str,
    pub retry_after: u64,
    pub timestamp: String,
    pub request_id: String,
}

/// A rate limit violation ready to be sent to the client.
#[derive(Debug, Clone)]
pub struct Rejection {
    violation: RateLimitViolation,
    request_id: String,
}

impl Rejection {
    pub fn new(violation: RateLimitViolation, request_id: String) -> Self {
        Self {
            violation,
            request_id,
        }
    }

    pub fn body(&self) -> RejectionBody {
        RejectionBody {
            status: self.violation.status(),
            message: self.violation.message(),
            code: self.violation.code(),
            retry_after: self.violation.retry_after(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            request_id: self.request_id.clone(),
        }
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.violation.status())
            .unwrap_or(StatusCode::TOO_MANY_REQUESTS);
        let retry_after = HeaderValue::from(self.violation.retry_after());

        let mut response = (status, Json(self.body())).into_response();
        response.headers_mut().insert(header::RETRY_AFTER, retry_after);
        response
    }
}

/// Correlation id for a request: the caller's `x-request-id`, or a fresh UUID.
pub fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}
