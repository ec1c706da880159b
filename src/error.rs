//! Error types for the Turnstile rate limiter.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors reported by the shared counter backend
    #[error("Shared backend error: {0}")]
    Backend(#[from] redis::RedisError),

    /// A shared backend operation did not finish in time
    #[error("Shared backend operation timed out after {0:?}")]
    Timeout(Duration),

    /// The shared backend has no live connection
    #[error("Shared backend is not connected")]
    NotConnected,

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, LimiterError>;

/// A request rejected by the limiter.
///
/// Both variants are recoverable by the client after `retry_after` seconds.
/// They are kept apart so that infrastructure trouble can be alerted on
/// separately from abusive clients.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitViolation {
    /// The client exhausted its quota for the current window.
    #[error("Too many requests, please try again later")]
    QuotaExceeded { retry_after: u64 },

    /// The shared backend is required but unreachable.
    #[error("Rate limit backend unavailable")]
    BackendUnavailable { retry_after: u64 },
}

impl RateLimitViolation {
    /// Machine-readable code for response bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RateLimitViolation::QuotaExceeded { .. } => "THROTTLED",
            RateLimitViolation::BackendUnavailable { .. } => "RATE_LIMIT_BACKEND_UNAVAILABLE",
        }
    }

    /// Human-readable message for response bodies.
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Seconds the client should wait before retrying.
    pub fn retry_after(&self) -> u64 {
        match self {
            RateLimitViolation::QuotaExceeded { retry_after }
            | RateLimitViolation::BackendUnavailable { retry_after } => *retry_after,
        }
    }

    /// HTTP status code the violation maps to.
    pub fn status(&self) -> u16 {
        match self {
            RateLimitViolation::QuotaExceeded { .. } => 429,
            RateLimitViolation::BackendUnavailable { .. } => 503,
        }
    }
}
