//! Error types for slidegate.

use std::time::Duration;

use thiserror::Error;

/// Main error type for slidegate operations.
#[derive(Error, Debug)]
pub enum SlidegateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors returned by the backing store
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The store did not answer within the configured call timeout
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with a result that cannot be interpreted
    #[error("Decode error: {0}")]
    Decode(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for slidegate operations.
pub type Result<T> = std::result::Result<T, SlidegateError>;
