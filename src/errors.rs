//! Cache error types
//!
//! Structured error handling using thiserror instead of `Box<dyn Error>`
//! patterns. Transport failures are only ever surfaced from construction
//! and teardown; during normal operation they are absorbed by the
//! connection supervisor and exposed through the reconnection events.

use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by cache operations
#[derive(Debug, Error)]
pub enum CacheError {
    /// The cache has been closed; every operation except `close` is rejected
    #[error("cache is closing: {operation} rejected")]
    Closing { operation: &'static str },

    /// Construction options failed validation
    #[error("invalid cache options: {message}")]
    InvalidOptions { message: String },

    /// AMQP transport failure during construction or teardown
    #[error("amqp transport error: {0}")]
    Transport(#[from] lapin::Error),

    /// Connecting to the broker exceeded the configured timeout
    #[error("amqp connect timed out after {timeout_seconds}s")]
    ConnectTimeout { timeout_seconds: u32 },

    /// The user-supplied loader failed; every caller coalesced onto the
    /// same load receives the same failure
    #[error("loader failed for key {key}: {source}")]
    Load {
        key: String,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },
}

impl CacheError {
    /// Create a closing error for a rejected operation
    pub fn closing(operation: &'static str) -> Self {
        Self::Closing { operation }
    }

    /// Create an invalid-options error
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::InvalidOptions {
            message: message.into(),
        }
    }

    /// Create a loader error for a key
    pub fn load(key: impl Into<String>, source: Arc<dyn std::error::Error + Send + Sync>) -> Self {
        Self::Load {
            key: key.into(),
            source,
        }
    }
}

impl From<validator::ValidationErrors> for CacheError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::invalid_options(errors.to_string())
    }
}

/// Result type for cache operations
pub type CacheResult<T> = Result<T, CacheError>;
