//! Error types for Turnstile.

use thiserror::Error;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// The rate limit is missing, not a number, or not greater than zero
    #[error("Invalid rate limit: {0}")]
    InvalidRateLimit(String),

    /// Conflicting or unresolvable limiter options
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Configuration file or environment loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A background task could not be spawned
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Failures reported by an external token store
    #[error("Store error: {0}")]
    Store(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
