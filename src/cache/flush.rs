//! Flush executor - build one batch, dispatch it, fan results back out
//!
//! Batch layout, in order:
//!
//! 1. one `set`/`del` per surviving write intent
//! 2. one `expire` per read key (only with `refresh_ttl_on_read`)
//! 3. one `get` per read key
//!
//! Writes precede reads, so a read recorded in the same tick as a write to
//! the same key observes the written value. Each op's result is delivered to
//! its own waiters only; a failed op never affects its siblings and nothing
//! is retried or re-buffered.

use std::sync::Arc;

use tracing::{debug, warn};
use uuid::Uuid;

use super::buffer::{Drained, PendingRead, PendingWrite, Waiter, WriteIntent};
use super::codec::{self, Versioned};
use super::stats::StatsCounters;
use crate::backend::{Backend, BatchOp, OpOutput, OpResult};
use crate::config::CacheConfig;
use crate::types::{CacheError, Result};

/// Who receives the result of each op in a batch, positionally
enum Target {
    Write(Vec<Waiter<()>>),
    Refresh,
    Read(Vec<Waiter<Versioned>>),
}

/// Executes flushes and bulk deletes against the backend
pub(crate) struct FlushExecutor {
    backend: Arc<dyn Backend>,
    config: Arc<CacheConfig>,
    stats: Arc<StatsCounters>,
    cache_id: Uuid,
}

impl FlushExecutor {
    pub fn new(
        backend: Arc<dyn Backend>,
        config: Arc<CacheConfig>,
        stats: Arc<StatsCounters>,
        cache_id: Uuid,
    ) -> Self {
        Self {
            backend,
            config,
            stats,
            cache_id,
        }
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    /// Dispatch everything drained from the buffer as one batch
    pub async fn execute(&self, drained: Drained) {
        if drained.is_empty() {
            return;
        }

        let waiters = drained.waiter_count();
        let (ops, targets) = self.build_batch(drained);
        let op_count = ops.len();

        debug!(
            cache = %self.cache_id,
            ops = op_count,
            waiters = waiters,
            "Dispatching coalesced batch"
        );

        let results = self.dispatch(ops).await;
        self.stats.record_flush(op_count);

        for (result, target) in results.into_iter().zip(targets) {
            self.deliver(result, target);
        }
    }

    /// Turn drained intents into backend ops plus their result targets
    fn build_batch(&self, drained: Drained) -> (Vec<BatchOp>, Vec<Target>) {
        let refresh = self.config.refresh_ttl_on_read;
        let capacity = drained.writes.len() + drained.reads.len() * if refresh { 2 } else { 1 };
        let mut ops = Vec::with_capacity(capacity);
        let mut targets = Vec::with_capacity(capacity);

        for (key, PendingWrite { intent, waiters }) in drained.writes {
            let backend_key = self.config.backend_key(&key);
            let op = match intent {
                WriteIntent::Set { version, value } => match codec::encode(version, &value) {
                    Ok(blob) => BatchOp::Set {
                        key: backend_key,
                        blob,
                        ttl_seconds: self.config.ttl_seconds,
                    },
                    Err(e) => {
                        warn!(cache = %self.cache_id, key = %key, error = %e, "Envelope encode failed");
                        resolve_all(waiters, Err(e));
                        continue;
                    }
                },
                WriteIntent::Delete => BatchOp::Del { key: backend_key },
            };
            ops.push(op);
            targets.push(Target::Write(waiters));
        }

        if let (true, Some(ttl_seconds)) = (refresh, self.config.ttl_seconds) {
            for (key, _) in &drained.reads {
                ops.push(BatchOp::Expire {
                    key: self.config.backend_key(key),
                    ttl_seconds,
                });
                targets.push(Target::Refresh);
            }
        }

        for (key, PendingRead { waiters }) in drained.reads {
            ops.push(BatchOp::Get {
                key: self.config.backend_key(&key),
            });
            targets.push(Target::Read(waiters));
        }

        (ops, targets)
    }

    /// One round trip; always yields exactly one result per op
    async fn dispatch(&self, ops: Vec<BatchOp>) -> Vec<OpResult> {
        let expected = ops.len();
        let mut results = self.backend.execute_batch(ops).await;

        if results.len() != expected {
            warn!(
                cache = %self.cache_id,
                expected = expected,
                got = results.len(),
                "Backend returned wrong number of results"
            );
            results.resize(
                expected,
                Err(CacheError::BackendOperation(
                    "Backend returned no result for this operation".to_string(),
                )),
            );
        }

        results
    }

    fn deliver(&self, result: OpResult, target: Target) {
        match target {
            Target::Write(waiters) => {
                let outcome = result.map(|_| ());
                if let Err(e) = &outcome {
                    self.stats.record_failure();
                    warn!(cache = %self.cache_id, error = %e, "Write failed");
                }
                resolve_all(waiters, outcome);
            }
            Target::Refresh => {
                if let Err(e) = result {
                    self.stats.record_failure();
                    warn!(cache = %self.cache_id, error = %e, "Expiry refresh failed");
                }
            }
            Target::Read(waiters) => {
                let outcome = self.read_outcome(result);
                resolve_all(waiters, outcome);
            }
        }
    }

    /// Map a raw `get` result to what read callers observe
    fn read_outcome(&self, result: OpResult) -> Result<Versioned> {
        match result {
            Err(e) => {
                self.stats.record_failure();
                warn!(cache = %self.cache_id, error = %e, "Read failed");
                Err(e)
            }
            Ok(OpOutput::Value(None)) => Ok(Versioned::absent()),
            Ok(OpOutput::Value(Some(raw))) => codec::decode(&raw).map(Versioned::from).map_err(|e| {
                self.stats.record_decode_failure();
                warn!(cache = %self.cache_id, error = %e, "Stored envelope did not decode");
                e
            }),
            Ok(OpOutput::Done) => {
                self.stats.record_failure();
                Err(CacheError::BackendOperation(
                    "Backend answered a get without a value".to_string(),
                ))
            }
        }
    }

    /// Immediate single-shot batch of deletes, bypassing the buffer.
    ///
    /// Every delete runs; the first failure (if any) is returned.
    pub async fn delete_bulk(&self, keys: Vec<String>) -> Result<()> {
        if keys.is_empty() {
            return Ok(());
        }

        let ops: Vec<BatchOp> = keys
            .iter()
            .map(|key| BatchOp::Del {
                key: self.config.backend_key(key),
            })
            .collect();
        let op_count = ops.len();

        debug!(cache = %self.cache_id, ops = op_count, "Dispatching bulk delete");
        let results = self.dispatch(ops).await;
        self.stats.record_bulk_delete(op_count);

        let mut first_error = None;
        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                self.stats.record_failure();
                warn!(cache = %self.cache_id, key = %key, error = %e, "Bulk delete failed for key");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn resolve_all<T: Clone>(waiters: Vec<Waiter<T>>, outcome: Result<T>) {
    for waiter in waiters {
        // Receiver dropped: the caller stopped waiting
        let _ = waiter.send(outcome.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::cache::buffer::PendingBuffer;
    use serde_json::json;
    use tokio::sync::oneshot;

    fn executor(backend: Arc<MemoryBackend>, config: CacheConfig) -> FlushExecutor {
        FlushExecutor::new(
            backend,
            Arc::new(config),
            Arc::new(StatsCounters::default()),
            Uuid::new_v4(),
        )
    }

    #[tokio::test]
    async fn test_batch_orders_writes_before_reads() {
        let backend = Arc::new(MemoryBackend::new());
        let exec = executor(Arc::clone(&backend), CacheConfig::default());

        let mut buffer = PendingBuffer::new();
        let (rtx, rrx) = oneshot::channel();
        let (wtx, wrx) = oneshot::channel();
        buffer.record_read("k".into(), rtx);
        buffer.record_write(
            "k".into(),
            WriteIntent::Set {
                version: 5,
                value: json!("x"),
            },
            wtx,
        );

        exec.execute(buffer.drain()).await;

        let batches = backend.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0][0].name(), "set");
        assert_eq!(batches[0][1].name(), "get");

        assert_eq!(wrx.await.unwrap(), Ok(()));
        let read = rrx.await.unwrap().unwrap();
        assert_eq!(read.version, 5);
        assert_eq!(read.value, Some(json!("x")));
    }

    #[tokio::test]
    async fn test_refresh_ops_precede_gets() {
        let backend = Arc::new(MemoryBackend::new());
        let config = CacheConfig {
            ttl_seconds: Some(30),
            refresh_ttl_on_read: true,
            ..Default::default()
        };
        let exec = executor(Arc::clone(&backend), config);

        let mut buffer = PendingBuffer::new();
        let (tx, rx) = oneshot::channel();
        buffer.record_read("k".into(), tx);
        exec.execute(buffer.drain()).await;

        let names: Vec<&str> = backend.batches()[0].iter().map(|op| op.name()).collect();
        assert_eq!(names, vec!["expire", "get"]);
        assert!(rx.await.unwrap().unwrap().is_absent());
    }

    #[tokio::test]
    async fn test_empty_drain_dispatches_nothing() {
        let backend = Arc::new(MemoryBackend::new());
        let exec = executor(Arc::clone(&backend), CacheConfig::default());

        exec.execute(PendingBuffer::new().drain()).await;
        assert_eq!(backend.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_delete_bulk_reports_first_failure() {
        let backend = Arc::new(MemoryBackend::new());
        backend.insert_raw("a", b"1".to_vec());
        backend.insert_raw("c", b"3".to_vec());
        backend.fail_key("b");
        let exec = executor(Arc::clone(&backend), CacheConfig::default());

        let result = exec
            .delete_bulk(vec!["a".into(), "b".into(), "c".into()])
            .await;

        assert!(matches!(result, Err(CacheError::BackendOperation(_))));
        assert!(backend.raw("a").is_none());
        assert!(backend.raw("c").is_none());
        assert_eq!(backend.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_bulk_empty_is_noop() {
        let backend = Arc::new(MemoryBackend::new());
        let exec = executor(Arc::clone(&backend), CacheConfig::default());

        assert!(exec.delete_bulk(Vec::new()).await.is_ok());
        assert_eq!(backend.batch_count(), 0);
    }
}
