//! Tollgate error types

use std::time::Duration;

/// How the scheduler treats a failed outbound call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Remote service refused for quota reasons. Pauses the whole scheduler.
    RateLimit,
    /// Network or server-side failure. Retried with backoff.
    Transient,
    /// Anything else. Rejected immediately.
    Permanent,
}

/// Tollgate error types
#[derive(Debug, thiserror::Error)]
pub enum TollgateError {
    // Outbound call errors
    #[error("rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Option<Duration> },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("permanent failure: {0}")]
    Permanent(String),

    // Scheduler errors
    #[error("scheduler dropped the request before it settled")]
    SchedulerClosed,

    // Cache errors (never surfaced by `TieredCache::fetch`)
    #[error("corrupt cache record {key}: {reason}")]
    CacheCorruption { key: String, reason: String },

    #[error("durable storage exhausted: need {needed} bytes, budget is {budget}")]
    StorageExhausted { needed: u64, budget: u64 },

    #[error("storage error: {0}")]
    Storage(String),

    // Data errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("batch returned no result for this item")]
    BatchItemMissing,

    #[error("batch '{processor}' failed: {message}")]
    BatchFailed { processor: String, message: String },

    // Configuration errors
    #[error("configuration error: {0}")]
    Configuration(String),
}

impl TollgateError {
    /// Build an error from an HTTP status line.
    ///
    /// 429 becomes [`RateLimited`](Self::RateLimited), every other status is
    /// kept as [`Api`](Self::Api) and classified by [`failure_class`](Self::failure_class).
    pub fn from_status(status: u16, message: impl Into<String>, retry_after: Option<Duration>) -> Self {
        if status == 429 {
            TollgateError::RateLimited { retry_after }
        } else {
            TollgateError::Api {
                status,
                message: message.into(),
            }
        }
    }

    /// Classify this error for the scheduler's retry and circuit-breaker logic.
    pub fn failure_class(&self) -> FailureClass {
        match self {
            TollgateError::RateLimited { .. } => FailureClass::RateLimit,
            TollgateError::Api { status: 429, .. } => FailureClass::RateLimit,
            TollgateError::Http(_) => FailureClass::Transient,
            TollgateError::Api { status, .. } if *status >= 500 => FailureClass::Transient,
            _ => FailureClass::Permanent,
        }
    }

    /// Whether the error is retried in place with backoff.
    pub fn is_transient(&self) -> bool {
        self.failure_class() == FailureClass::Transient
    }

    /// Whether the error trips the circuit breaker.
    pub fn is_rate_limit(&self) -> bool {
        self.failure_class() == FailureClass::RateLimit
    }

    /// Provider-supplied wait hint, if any.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            TollgateError::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TollgateError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return TollgateError::from_status(status.as_u16(), err.to_string(), None);
        }
        if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
            TollgateError::Http(err.to_string())
        } else if err.is_decode() {
            TollgateError::InvalidInput(err.to_string())
        } else {
            TollgateError::Permanent(err.to_string())
        }
    }
}

/// Result type alias for Tollgate operations
pub type Result<T> = std::result::Result<T, TollgateError>;
