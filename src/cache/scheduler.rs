//! Flush scheduler
//!
//! Two states, owned by a single cache instance:
//!
//! ```text
//!  Idle ──(first record since last flush)──► Armed   spawn one flush task
//!  Armed ──(further records)───────────────► Armed   no-op, same batch
//!  Armed ──(flush task fires)──────────────► Idle    then drain + dispatch
//! ```
//!
//! The flush task yields once before firing, so every request recorded in the
//! same run of the caller's task lands in one batch. That only holds on a
//! current-thread runtime, where the flush task cannot run while the caller is
//! still recording; the cache refuses to start on any other flavor.
//!
//! `arm` and `fire` must be called while holding the buffer lock; that is what
//! makes the drain atomic with respect to new recordings. Each arming gets a
//! generation number, and a spawned task only fires the generation it was
//! spawned for. A task left behind by a manual flush is a no-op.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::runtime::Handle;
use tracing::trace;

/// Observable scheduler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// No flush pending
    Idle,
    /// One flush task spawned and not yet fired
    Armed,
}

/// Per-instance flush scheduler
pub struct FlushScheduler {
    armed: AtomicBool,
    /// Incremented on every Idle → Armed transition
    generation: AtomicU64,
    runtime: Handle,
}

impl FlushScheduler {
    /// Create a scheduler that spawns flush tasks on `runtime`
    pub fn new(runtime: Handle) -> Self {
        Self {
            armed: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            runtime,
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.armed.load(Ordering::Acquire) {
            SchedulerState::Armed
        } else {
            SchedulerState::Idle
        }
    }

    /// Idle → Armed. Returns the new generation if this call armed the
    /// scheduler, in which case the caller must `schedule` exactly one flush
    /// for it.
    pub fn arm(&self) -> Option<u64> {
        self.armed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| self.generation.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Armed → Idle regardless of generation (manual flush, close).
    /// Returns true if a flush was pending.
    pub fn fire(&self) -> bool {
        self.armed.swap(false, Ordering::AcqRel)
    }

    /// Armed → Idle, only if `generation` is still the armed one
    pub fn fire_scheduled(&self, generation: u64) -> bool {
        if self.generation.load(Ordering::Acquire) != generation {
            return false;
        }
        self.armed.swap(false, Ordering::AcqRel)
    }

    /// Run `flush` on the next scheduling tick
    pub fn schedule<F>(&self, generation: u64, flush: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        trace!(generation = generation, "Flush scheduled for next tick");

        self.runtime.spawn(async move {
            tokio::task::yield_now().await;
            flush.await;
        });
    }

    /// Number of flush tasks spawned so far
    pub fn scheduled_count(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }
}
