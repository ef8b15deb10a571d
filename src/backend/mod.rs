//! Backend collaborator
//!
//! The cache never talks to storage directly. It hands a batch of operations
//! to a [`Backend`] and receives one result per operation, in order. A failed
//! operation never fails its siblings; a transport failure is reported against
//! every operation in the batch.
//!
//! Implementations:
//! - [`RedisBackend`] - pipelined Redis via `ConnectionManager`
//! - [`MemoryBackend`] - in-process map with fault injection, for tests and dev

pub mod memory;
pub mod redis_backend;

pub use self::memory::MemoryBackend;
pub use self::redis_backend::RedisBackend;

use crate::types::Result;

/// A single operation inside a pipelined batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BatchOp {
    /// Read the raw blob stored under `key`
    Get { key: String },
    /// Store `blob` under `key`, optionally expiring after `ttl_seconds`
    Set {
        key: String,
        blob: Vec<u8>,
        ttl_seconds: Option<u64>,
    },
    /// Remove `key`
    Del { key: String },
    /// Reset the expiry of an existing `key`
    Expire { key: String, ttl_seconds: u64 },
}

impl BatchOp {
    pub fn key(&self) -> &str {
        match self {
            BatchOp::Get { key }
            | BatchOp::Set { key, .. }
            | BatchOp::Del { key }
            | BatchOp::Expire { key, .. } => key,
        }
    }

    /// Short command name for logging
    pub fn name(&self) -> &'static str {
        match self {
            BatchOp::Get { .. } => "get",
            BatchOp::Set { .. } => "set",
            BatchOp::Del { .. } => "del",
            BatchOp::Expire { .. } => "expire",
        }
    }
}

/// Successful result of one batch operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpOutput {
    /// Result of a `Get`; `None` when the key does not exist
    Value(Option<Vec<u8>>),
    /// Result of a `Set`, `Del` or `Expire`
    Done,
}

/// Per-operation outcome, positionally matched to the submitted ops
pub type OpResult = Result<OpOutput>;

/// Trait for key-value backends (allows mocking in tests)
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    /// Resolve once connectivity is established
    async fn ready(&self) -> Result<()>;

    /// Read a single blob
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Store a single blob
    async fn set(&self, key: &str, blob: Vec<u8>, ttl_seconds: Option<u64>) -> Result<()>;

    /// Remove a single key
    async fn del(&self, key: &str) -> Result<()>;

    /// Reset the expiry of a single key
    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()>;

    /// Execute all ops in one round trip.
    ///
    /// Must return exactly `ops.len()` results in submission order.
    async fn execute_batch(&self, ops: Vec<BatchOp>) -> Vec<OpResult>;

    /// Release the connection
    async fn close(&self) -> Result<()>;
}
