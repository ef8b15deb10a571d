//! Shared error and result types

use thiserror::Error;

/// Error types for cache operations
///
/// `Clone` because a single backend outcome is delivered to every waiter
/// attached to the intent that produced it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CacheError {
    /// Backend unreachable or connection lost
    #[error("Backend connection error: {0}")]
    Connection(String),

    /// A single get/set/del/expire failed inside a batch
    #[error("Backend operation failed: {0}")]
    BackendOperation(String),

    /// Stored blob did not parse as a valid envelope
    #[error("Decode error: {0}")]
    Decode(String),

    /// Caller value could not be serialized
    #[error("Encode error: {0}")]
    Encode(String),

    /// Configuration rejected at construction
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Versions supplied on write must be non-negative
    #[error("Invalid version {0}: versions must be non-negative")]
    InvalidVersion(i64),

    /// Cache was closed before the operation could be recorded or completed
    #[error("Cache closed")]
    Closed,
}

impl CacheError {
    /// True for errors caused by the stored data rather than the backend
    pub fn is_decode(&self) -> bool {
        matches!(self, CacheError::Decode(_))
    }
}

impl From<redis::RedisError> for CacheError {
    fn from(e: redis::RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() {
            CacheError::Connection(e.to_string())
        } else {
            CacheError::BackendOperation(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
