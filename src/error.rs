//! Error types for the Tollgate service.

use std::time::Duration;

use thiserror::Error;

/// Main error type for Tollgate operations.
///
/// None of these ever reach a rate-limited caller: the limiter fails open and
/// only configuration, store setup and sweeping report them.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rate limit policy failed validation
    #[error("Invalid rate limit policy: {0}")]
    Policy(String),

    /// Generic store failure
    #[error("Store error: {0}")]
    Store(String),

    /// PostgreSQL store errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A store operation exceeded its deadline
    #[error("Store operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
