//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Exceeding a quota is not an error; it is reported through
/// [`RateLimitInfo::exceeded`](crate::ratelimit::RateLimitInfo::exceeded).
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The counter store could not be reached or did not answer in time.
    #[error("Backend {backend} unavailable: {reason}")]
    BackendUnavailable {
        /// Name of the backend that failed
        backend: &'static str,
        /// Underlying failure
        reason: String,
    },

    /// The counter store answered, but with an error
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    /// Shorthand for a [`TurnstileError::BackendUnavailable`].
    pub fn unavailable(backend: &'static str, reason: impl Into<String>) -> Self {
        TurnstileError::BackendUnavailable {
            backend,
            reason: reason.into(),
        }
    }

    /// Whether this error means the store could not be reached.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, TurnstileError::BackendUnavailable { .. })
    }

    /// Classify a Redis error raised by `backend`.
    pub(crate) fn from_redis(backend: &'static str, err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
        {
            TurnstileError::unavailable(backend, err.to_string())
        } else {
            TurnstileError::Backend(err.to_string())
        }
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
