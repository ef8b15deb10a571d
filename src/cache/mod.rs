//! Coalescing cache facade
//!
//! Callers issue per-key reads, writes and deletes. Each call records an
//! intent immediately and returns a [`Completion`]; every intent recorded
//! before the next scheduling tick is dispatched to the backend as one
//! pipelined batch.
//!
//! ```text
//! caller ──► PendingBuffer ──► FlushScheduler ──► FlushExecutor ──► Backend
//!   ▲         (record/merge)    (arm once/tick)    (one batch)         │
//!   └──────────────── Completion resolved per key ◄────────────────────┘
//! ```
//!
//! **Usage:**
//! ```ignore
//! let cache = CoalescingCache::connect(CacheConfig::from_env()).await?;
//! cache.when_ready().await?;
//!
//! // Recorded together, dispatched together
//! let (written, read) = tokio::join!(cache.set("doc:1", 5, &"x"), cache.get("doc:1"));
//! written?;
//! assert_eq!(read?.version, 5);
//! ```

mod buffer;
pub mod codec;
mod flush;
pub mod scheduler;
mod stats;

pub use buffer::WriteIntent;
pub use codec::{Envelope, Versioned, ABSENT_VERSION};
pub use scheduler::{FlushScheduler, SchedulerState};
pub use stats::CacheStats;

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};

use serde::Serialize;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{oneshot, Mutex as AsyncMutex};
use tracing::{debug, info};
use uuid::Uuid;

use crate::backend::{Backend, RedisBackend};
use crate::config::CacheConfig;
use crate::types::{CacheError, Result};
use buffer::{PendingBuffer, Recorded};
use flush::FlushExecutor;
use stats::StatsCounters;

// ============================================================================
// Completion
// ============================================================================

/// Future resolving to the outcome of one recorded operation.
///
/// The intent is already buffered by the time this is returned; awaiting it
/// only waits for the flush it belongs to.
#[must_use = "the operation is recorded, but its outcome is only observed by awaiting"]
pub struct Completion<T> {
    state: CompletionState<T>,
}

enum CompletionState<T> {
    Waiting(oneshot::Receiver<Result<T>>),
    Ready(Option<Result<T>>),
}

impl<T> Completion<T> {
    fn waiting(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            state: CompletionState::Waiting(rx),
        }
    }

    fn ready(outcome: Result<T>) -> Self {
        Self {
            state: CompletionState::Ready(Some(outcome)),
        }
    }
}

// `T` is only ever moved out by value, never pinned
impl<T> Unpin for Completion<T> {}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &mut self.state {
            // Sender dropped without an outcome: the flush never ran
            CompletionState::Waiting(rx) => Pin::new(rx)
                .poll(cx)
                .map(|received| received.unwrap_or(Err(CacheError::Closed))),
            CompletionState::Ready(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(Err(CacheError::Closed)))
            }
        }
    }
}

// ============================================================================
// Cache
// ============================================================================

struct Inner {
    id: Uuid,
    buffer: Mutex<PendingBuffer>,
    scheduler: FlushScheduler,
    executor: FlushExecutor,
    /// Held for the whole of a flush, so batches reach the backend one at a time
    dispatch: AsyncMutex<()>,
    stats: Arc<StatsCounters>,
    closed: AtomicBool,
}

impl Inner {
    fn lock_buffer(&self) -> MutexGuard<'_, PendingBuffer> {
        // Buffer mutations never panic midway, so a poisoned lock is still consistent
        self.buffer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fire the scheduler and drain the buffer as one atomic step, then dispatch.
    ///
    /// `generation` is set for scheduled flushes, which only fire the arming
    /// they were spawned for. `None` fires unconditionally.
    async fn flush(&self, generation: Option<u64>) {
        // Recordings made while an earlier batch is in flight keep joining the
        // armed batch until this lock is acquired
        let _dispatch = self.dispatch.lock().await;

        let drained = {
            let mut buffer = self.lock_buffer();
            let fired = match generation {
                Some(generation) => self.scheduler.fire_scheduled(generation),
                None => {
                    self.scheduler.fire();
                    true
                }
            };
            if !fired || buffer.is_empty() {
                return;
            }
            buffer.drain()
        };
        self.executor.execute(drained).await;
    }
}

/// Write-coalescing cache facade. Cheap to clone; clones share one buffer.
#[derive(Clone)]
pub struct CoalescingCache {
    inner: Arc<Inner>,
}

impl CoalescingCache {
    /// Connect to the Redis backend described by `config`
    pub async fn connect(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let backend = RedisBackend::connect(&config.backend).await?;
        Self::with_backend(config, Arc::new(backend))
    }

    /// Build a cache over any backend.
    ///
    /// Must be called inside a current-thread tokio runtime; flushes are
    /// spawned on that runtime. On a multi-threaded runtime the flush task
    /// could run while a caller is still recording and split its batch, so
    /// that flavor is rejected with `CacheError::Config`.
    pub fn with_backend(config: CacheConfig, backend: Arc<dyn Backend>) -> Result<Self> {
        config.validate()?;
        let runtime = Handle::try_current().map_err(|_| {
            CacheError::Config("cache must be created inside a tokio runtime".to_string())
        })?;
        if runtime.runtime_flavor() != RuntimeFlavor::CurrentThread {
            return Err(CacheError::Config(
                "cache requires a current-thread tokio runtime".to_string(),
            ));
        }

        let id = Uuid::new_v4();
        let stats = Arc::new(StatsCounters::default());

        info!(
            cache = %id,
            ttl_seconds = ?config.ttl_seconds,
            key_prefix = ?config.key_prefix,
            "Coalescing cache initialized"
        );

        let executor = FlushExecutor::new(backend, Arc::new(config), Arc::clone(&stats), id);

        Ok(Self {
            inner: Arc::new(Inner {
                id,
                buffer: Mutex::new(PendingBuffer::new()),
                scheduler: FlushScheduler::new(runtime),
                executor,
                dispatch: AsyncMutex::new(()),
                stats,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Instance identifier used in log fields
    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Read `key`. Resolves to `Versioned::absent()` when there is no record.
    pub fn get(&self, key: impl Into<String>) -> Completion<Versioned> {
        let key = key.into();
        let (tx, rx) = oneshot::channel();

        let recorded = self.record(|buffer| buffer.record_read(key.clone(), tx));
        match recorded {
            Ok(Recorded::Coalesced) => {
                self.inner.stats.record_read_coalesced();
                debug!(cache = %self.inner.id, key = %key, "Read joined pending read");
            }
            Ok(Recorded::New) => {}
            Err(e) => return Completion::ready(Err(e)),
        }

        Completion::waiting(rx)
    }

    /// Write `value` at `version` under `key`
    pub fn set<V>(&self, key: impl Into<String>, version: i64, value: &V) -> Completion<()>
    where
        V: Serialize + ?Sized,
    {
        if version < 0 {
            return Completion::ready(Err(CacheError::InvalidVersion(version)));
        }

        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                return Completion::ready(Err(CacheError::Encode(format!(
                    "Value serialization failed: {e}"
                ))))
            }
        };

        self.write(key.into(), WriteIntent::Set { version, value })
    }

    /// Delete `key`
    pub fn delete(&self, key: impl Into<String>) -> Completion<()> {
        self.write(key.into(), WriteIntent::Delete)
    }

    /// Delete many keys in one immediate round trip, bypassing coalescing.
    ///
    /// Every delete is attempted; the first failure is returned.
    pub async fn delete_bulk<I, K>(&self, keys: I) -> Result<()>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(CacheError::Closed);
        }
        let keys: Vec<String> = keys.into_iter().map(Into::into).collect();
        self.inner.executor.delete_bulk(keys).await
    }

    fn write(&self, key: String, intent: WriteIntent) -> Completion<()> {
        let (tx, rx) = oneshot::channel();

        let recorded = self.record(|buffer| buffer.record_write(key.clone(), intent, tx));
        match recorded {
            Ok(Recorded::Coalesced) => {
                self.inner.stats.record_superseded();
                debug!(cache = %self.inner.id, key = %key, "Pending write superseded");
            }
            Ok(Recorded::New) => {}
            Err(e) => return Completion::ready(Err(e)),
        }

        Completion::waiting(rx)
    }

    /// Apply `mutate` to the buffer and arm the scheduler, under one lock
    fn record<F>(&self, mutate: F) -> Result<Recorded>
    where
        F: FnOnce(&mut PendingBuffer) -> Recorded,
    {
        let should_schedule = {
            let mut buffer = self.inner.lock_buffer();
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(CacheError::Closed);
            }
            let recorded = mutate(&mut *buffer);
            (recorded, self.inner.scheduler.arm())
        };

        let (recorded, armed) = should_schedule;
        if let Some(generation) = armed {
            let inner = Arc::clone(&self.inner);
            self.inner.scheduler.schedule(generation, async move {
                inner.flush(Some(generation)).await;
            });
        }

        Ok(recorded)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Resolve once the backend is reachable
    pub async fn when_ready(&self) -> Result<()> {
        self.inner.executor.backend().ready().await
    }

    /// Dispatch whatever is buffered now instead of waiting for the tick
    pub async fn flush(&self) {
        self.inner.flush(None).await;
    }

    /// Flush buffered intents, then release the backend.
    ///
    /// Operations issued after this call resolve with `CacheError::Closed`.
    pub async fn close(&self) -> Result<()> {
        {
            let _buffer = self.inner.lock_buffer();
            if self.inner.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
        }

        self.inner.flush(None).await;
        info!(cache = %self.inner.id, "Coalescing cache closed");
        self.inner.executor.backend().close().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn stats(&self) -> CacheStats {
        self.inner.stats.snapshot()
    }

    pub fn scheduler_state(&self) -> SchedulerState {
        self.inner.scheduler.state()
    }

    /// (write intents, read intents) waiting for the next flush
    pub fn pending(&self) -> (usize, usize) {
        self.inner.lock_buffer().len()
    }

    /// The write intent currently buffered for `key`, if any
    pub fn pending_write(&self, key: &str) -> Option<WriteIntent> {
        self.inner.lock_buffer().write_intent(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;

    fn memory_cache(config: CacheConfig) -> (CoalescingCache, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        let cache = CoalescingCache::with_backend(config, backend.clone()).unwrap();
        (cache, backend)
    }

    #[tokio::test]
    async fn test_recording_is_eager() {
        let (cache, backend) = memory_cache(CacheConfig::default());

        let pending_set = cache.set("k", 1, &"v");
        assert_eq!(cache.pending(), (1, 0));
        assert_eq!(cache.scheduler_state(), SchedulerState::Armed);
        assert_eq!(
            cache.pending_write("k"),
            Some(WriteIntent::Set {
                version: 1,
                value: json!("v")
            })
        );

        pending_set.await.unwrap();
        assert_eq!(cache.pending(), (0, 0));
        assert_eq!(cache.scheduler_state(), SchedulerState::Idle);
        assert_eq!(backend.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_version_resolves_immediately() {
        let (cache, backend) = memory_cache(CacheConfig::default());

        let result = cache.set("k", -5, &"v").await;
        assert_eq!(result, Err(CacheError::InvalidVersion(-5)));
        assert_eq!(cache.pending(), (0, 0));
        assert_eq!(cache.scheduler_state(), SchedulerState::Idle);
        assert_eq!(backend.batch_count(), 0);
    }

    #[tokio::test]
    async fn test_unserializable_value_is_encode_error() {
        let (cache, _backend) = memory_cache(CacheConfig::default());

        let mut bad = std::collections::HashMap::new();
        bad.insert(vec![1u8], "non-string map key");

        let result = cache.set("k", 1, &bad).await;
        assert!(matches!(result, Err(CacheError::Encode(_))));
    }

    #[tokio::test]
    async fn test_manual_flush_preempts_tick() {
        let (cache, backend) = memory_cache(CacheConfig::default());

        let pending = cache.delete("k");
        cache.flush().await;
        assert_eq!(backend.batch_count(), 1);
        assert_eq!(cache.scheduler_state(), SchedulerState::Idle);

        pending.await.unwrap();
        // The already-spawned tick finds an empty buffer and dispatches nothing
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;
        assert_eq!(backend.batch_count(), 1);
    }

    #[tokio::test]
    async fn test_close_flushes_then_rejects() {
        let (cache, backend) = memory_cache(CacheConfig::default());

        let pending = cache.set("k", 3, &json!({"a": 1}));
        cache.close().await.unwrap();

        pending.await.unwrap();
        assert!(backend.raw("k").is_some());
        assert!(backend.is_closed());
        assert!(cache.is_closed());

        assert_eq!(cache.get("k").await, Err(CacheError::Closed));
        assert_eq!(cache.delete_bulk(["k"]).await, Err(CacheError::Closed));
        // Closing twice is harmless
        assert!(cache.close().await.is_ok());
    }

    #[test]
    fn test_requires_runtime() {
        let backend = Arc::new(MemoryBackend::new());
        let result = CoalescingCache::with_backend(CacheConfig::default(), backend);
        assert!(matches!(result, Err(CacheError::Config(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rejects_multi_thread_runtime() {
        let backend = Arc::new(MemoryBackend::new());
        let result = CoalescingCache::with_backend(CacheConfig::default(), backend);
        assert!(matches!(result, Err(CacheError::Config(ref msg)) if msg.contains("current-thread")));
    }

    #[tokio::test]
    async fn test_manual_flush_leaves_later_tick_intact() {
        let (cache, backend) = memory_cache(CacheConfig::default());

        let first = cache.delete("a");
        cache.flush().await;
        let second = cache.delete("b");
        assert_eq!(cache.scheduler_state(), SchedulerState::Armed);
        assert_eq!(cache.inner.scheduler.scheduled_count(), 2);

        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(backend.batch_count(), 2);
        assert_eq!(cache.scheduler_state(), SchedulerState::Idle);
        assert_eq!(cache.pending(), (0, 0));
    }

    #[test]
    fn test_rejects_invalid_config() {
        tokio_test::block_on(async {
            let backend = Arc::new(MemoryBackend::new());
            let result =
                CoalescingCache::with_backend(CacheConfig::default().with_ttl(0), backend);
            assert!(matches!(result, Err(CacheError::Config(_))));
        });
    }
}
