//! Coalescing Cache - write-coalescing facade over a key-value backend
//!
//! Many callers issue per-key reads, writes and deletes concurrently. Requests
//! recorded within the same scheduling tick are merged into a single pipelined
//! round trip to the backend, and each caller receives its own result.
//!
//! ## Components
//!
//! - **Entry Codec**: versioned `{version, value}` envelope stored as one blob
//! - **Pending Buffer**: one write intent and one read intent per key
//! - **Flush Scheduler**: arms once per tick, never more than one flush pending
//! - **Flush Executor**: drains, batches, dispatches, fans results back out
//! - **Backend**: Redis (pipelined) or in-memory

pub mod backend;
pub mod cache;
pub mod config;
pub mod types;

pub use backend::{Backend, BatchOp, MemoryBackend, OpOutput, RedisBackend};
pub use cache::{CacheStats, CoalescingCache, Completion, SchedulerState, Versioned, WriteIntent, ABSENT_VERSION};
pub use config::{Args, BackendOptions, CacheConfig};
pub use types::{CacheError, Result};
