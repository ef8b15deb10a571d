//! In-memory backend
//!
//! Thread-safe map with per-key expiry, used by tests and by the CLI's
//! `--backend memory` mode. Every dispatched batch is recorded so callers can
//! assert how requests were coalesced, and failures can be injected per key or
//! for the whole backend.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use super::{Backend, BatchOp, OpOutput, OpResult};
use crate::types::{CacheError, Result};

/// Stored blob with optional expiry
struct MemoryEntry {
    blob: Vec<u8>,
    expires_at: Option<Instant>,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now < at).unwrap_or(true)
    }
}

/// In-process key-value backend
#[derive(Default)]
pub struct MemoryBackend {
    entries: DashMap<String, MemoryEntry>,
    /// Every batch passed to `execute_batch`, in dispatch order
    batches: Mutex<Vec<Vec<BatchOp>>>,
    /// Keys whose operations fail
    failing_keys: Mutex<HashSet<String>>,
    /// Simulates a lost connection
    unreachable: AtomicBool,
    closed: AtomicBool,
    single_ops: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every operation touching `key` fail
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.into());
    }

    /// Stop failing operations on `key`
    pub fn heal_key(&self, key: &str) {
        self.failing_keys
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Simulate the backend being unreachable (or reachable again)
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    /// Store a raw blob directly, bypassing the cache (e.g. to plant corrupt data)
    pub fn insert_raw(&self, key: impl Into<String>, blob: impl Into<Vec<u8>>) {
        self.entries.insert(
            key.into(),
            MemoryEntry {
                blob: blob.into(),
                expires_at: None,
            },
        );
    }

    /// Read a raw blob directly, ignoring injected failures
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        self.entries
            .get(key)
            .filter(|e| e.is_live(now))
            .map(|e| e.blob.clone())
    }

    /// Remaining lifetime of `key`, `None` if it has no expiry or does not exist
    pub fn ttl_remaining(&self, key: &str) -> Option<Duration> {
        self.entries
            .get(key)
            .and_then(|e| e.expires_at)
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.iter().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All batches dispatched so far
    pub fn batches(&self) -> Vec<Vec<BatchOp>> {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of batch round trips so far
    pub fn batch_count(&self) -> usize {
        self.batches.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Number of non-batched single operations so far
    pub fn single_op_count(&self) -> u64 {
        self.single_ops.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(CacheError::Closed);
        }
        if self.unreachable.load(Ordering::Relaxed) {
            return Err(CacheError::Connection("memory backend unreachable".to_string()));
        }
        Ok(())
    }

    fn check_key(&self, op: &BatchOp) -> Result<()> {
        let failing = self.failing_keys.lock().unwrap_or_else(|e| e.into_inner());
        if failing.contains(op.key()) {
            return Err(CacheError::BackendOperation(format!(
                "{} {} failed: injected failure",
                op.name(),
                op.key()
            )));
        }
        Ok(())
    }

    /// Apply one operation against the map
    fn apply(&self, op: &BatchOp) -> OpResult {
        self.check_key(op)?;
        let now = Instant::now();

        match op {
            BatchOp::Get { key } => {
                let live = self.entries.get(key).map(|e| {
                    if e.is_live(now) {
                        Some(e.blob.clone())
                    } else {
                        None
                    }
                });
                match live {
                    Some(Some(blob)) => Ok(OpOutput::Value(Some(blob))),
                    Some(None) => {
                        self.entries.remove(key);
                        Ok(OpOutput::Value(None))
                    }
                    None => Ok(OpOutput::Value(None)),
                }
            }
            BatchOp::Set {
                key,
                blob,
                ttl_seconds,
            } => {
                let expires_at = ttl_seconds.map(|secs| now + Duration::from_secs(secs));
                self.entries.insert(
                    key.clone(),
                    MemoryEntry {
                        blob: blob.clone(),
                        expires_at,
                    },
                );
                Ok(OpOutput::Done)
            }
            BatchOp::Del { key } => {
                self.entries.remove(key);
                Ok(OpOutput::Done)
            }
            BatchOp::Expire { key, ttl_seconds } => {
                if let Some(mut entry) = self.entries.get_mut(key) {
                    if entry.is_live(now) {
                        entry.expires_at = Some(now + Duration::from_secs(*ttl_seconds));
                    }
                }
                Ok(OpOutput::Done)
            }
        }
    }

    fn apply_single(&self, op: BatchOp) -> OpResult {
        self.check_reachable()?;
        self.single_ops.fetch_add(1, Ordering::Relaxed);
        self.apply(&op)
    }
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn ready(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.apply_single(BatchOp::Get {
            key: key.to_string(),
        })? {
            OpOutput::Value(value) => Ok(value),
            OpOutput::Done => Ok(None),
        }
    }

    async fn set(&self, key: &str, blob: Vec<u8>, ttl_seconds: Option<u64>) -> Result<()> {
        self.apply_single(BatchOp::Set {
            key: key.to_string(),
            blob,
            ttl_seconds,
        })
        .map(|_| ())
    }

    async fn del(&self, key: &str) -> Result<()> {
        self.apply_single(BatchOp::Del {
            key: key.to_string(),
        })
        .map(|_| ())
    }

    async fn expire(&self, key: &str, ttl_seconds: u64) -> Result<()> {
        self.apply_single(BatchOp::Expire {
            key: key.to_string(),
            ttl_seconds,
        })
        .map(|_| ())
    }

    async fn execute_batch(&self, ops: Vec<BatchOp>) -> Vec<OpResult> {
        if let Err(e) = self.check_reachable() {
            return vec![Err(e); ops.len()];
        }

        debug!(ops = ops.len(), "Memory backend executing batch");
        let results = ops.iter().map(|op| self.apply(op)).collect();
        self.batches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(ops);
        results
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_results_are_positional() {
        let backend = MemoryBackend::new();
        backend.fail_key("bad");

        let results = backend
            .execute_batch(vec![
                BatchOp::Set {
                    key: "a".into(),
                    blob: b"1".to_vec(),
                    ttl_seconds: None,
                },
                BatchOp::Set {
                    key: "bad".into(),
                    blob: b"2".to_vec(),
                    ttl_seconds: None,
                },
                BatchOp::Get { key: "a".into() },
                BatchOp::Get {
                    key: "missing".into(),
                },
            ])
            .await;

        assert_eq!(results.len(), 4);
        assert_eq!(results[0], Ok(OpOutput::Done));
        assert!(matches!(results[1], Err(CacheError::BackendOperation(_))));
        assert_eq!(results[2], Ok(OpOutput::Value(Some(b"1".to_vec()))));
        assert_eq!(results[3], Ok(OpOutput::Value(None)));
        assert_eq!(backend.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_fails_every_op() {
        let backend = MemoryBackend::new();
        backend.set_unreachable(true);

        let results = backend
            .execute_batch(vec![
                BatchOp::Get { key: "a".into() },
                BatchOp::Del { key: "b".into() },
            ])
            .await;

        assert!(results
            .iter()
            .all(|r| matches!(r, Err(CacheError::Connection(_)))));
        assert!(backend.ready().await.is_err());

        backend.set_unreachable(false);
        assert!(backend.ready().await.is_ok());
    }

    #[tokio::test]
    async fn test_ttl_expiry() {
        let backend = MemoryBackend::new();
        backend.set("short", b"x".to_vec(), Some(60)).await.unwrap();

        let remaining = backend.ttl_remaining("short").expect("Should have expiry");
        assert!(remaining <= Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(55));

        backend.set("forever", b"y".to_vec(), None).await.unwrap();
        assert!(backend.ttl_remaining("forever").is_none());
        assert_eq!(backend.single_op_count(), 2);
    }

    #[tokio::test]
    async fn test_closed_backend() {
        let backend = MemoryBackend::new();
        backend.close().await.unwrap();
        assert!(backend.is_closed());
        assert_eq!(backend.get("a").await, Err(CacheError::Closed));
    }
}
