//! Error types for the Turnstile crate.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The shared store could not be reached or an operation timed out.
    ///
    /// This variant must reach the caller: a limiter that cannot evaluate a
    /// request is not the same as a limiter that admits it. The configured
    /// [`FailurePolicy`](crate::config::FailurePolicy) decides what the
    /// boundary layer does with it.
    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for TurnstileError {
    fn from(err: redis::RedisError) -> Self {
        TurnstileError::StoreUnavailable(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
