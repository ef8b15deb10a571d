//! Pending buffer - intents waiting for the next flush
//!
//! Holds at most one write intent and one read intent per key. A repeated
//! write replaces the earlier intent (last write wins) but keeps its waiters,
//! so every caller observes the outcome of the write that was actually
//! materialized. Repeated reads of a key share one backend `get`.
//!
//! Keys keep the position of their first recording, so batches are built in
//! a stable order.

use std::collections::HashMap;
use std::mem;

use serde_json::Value;
use tokio::sync::oneshot;

use super::codec::Versioned;
use crate::types::Result;

/// Completion channel of one caller
pub(crate) type Waiter<T> = oneshot::Sender<Result<T>>;

/// A buffered write
#[derive(Debug, Clone, PartialEq)]
pub enum WriteIntent {
    Set { version: i64, value: Value },
    Delete,
}

/// The surviving write intent for a key and everyone waiting on it
pub(crate) struct PendingWrite {
    pub intent: WriteIntent,
    pub waiters: Vec<Waiter<()>>,
}

/// Everyone waiting on a read of a key
pub(crate) struct PendingRead {
    pub waiters: Vec<Waiter<Versioned>>,
}

/// What `record_write` did to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Recorded {
    /// First intent for this key in the current batch
    New,
    /// Joined or replaced an existing intent for this key
    Coalesced,
}

/// Everything buffered since the last drain
#[derive(Default)]
pub(crate) struct Drained {
    pub writes: Vec<(String, PendingWrite)>,
    pub reads: Vec<(String, PendingRead)>,
}

impl Drained {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.reads.is_empty()
    }

    /// Number of caller waiters across all intents
    pub fn waiter_count(&self) -> usize {
        self.writes.iter().map(|(_, w)| w.waiters.len()).sum::<usize>()
            + self.reads.iter().map(|(_, r)| r.waiters.len()).sum::<usize>()
    }
}

/// Insertion-ordered intents keyed by cache key
#[derive(Default)]
pub(crate) struct PendingBuffer {
    writes: Vec<(String, PendingWrite)>,
    write_index: HashMap<String, usize>,
    reads: Vec<(String, PendingRead)>,
    read_index: HashMap<String, usize>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store or replace the write intent for `key`
    pub fn record_write(&mut self, key: String, intent: WriteIntent, waiter: Waiter<()>) -> Recorded {
        match self.write_index.get(&key) {
            Some(&slot) => {
                let pending = &mut self.writes[slot].1;
                pending.intent = intent;
                pending.waiters.push(waiter);
                Recorded::Coalesced
            }
            None => {
                self.write_index.insert(key.clone(), self.writes.len());
                self.writes.push((
                    key,
                    PendingWrite {
                        intent,
                        waiters: vec![waiter],
                    },
                ));
                Recorded::New
            }
        }
    }

    /// Register a read of `key`, joining an existing read if there is one
    pub fn record_read(&mut self, key: String, waiter: Waiter<Versioned>) -> Recorded {
        match self.read_index.get(&key) {
            Some(&slot) => {
                self.reads[slot].1.waiters.push(waiter);
                Recorded::Coalesced
            }
            None => {
                self.read_index.insert(key.clone(), self.reads.len());
                self.reads.push((
                    key,
                    PendingRead {
                        waiters: vec![waiter],
                    },
                ));
                Recorded::New
            }
        }
    }

    /// Remove and return every buffered intent, leaving the buffer empty
    pub fn drain(&mut self) -> Drained {
        self.write_index.clear();
        self.read_index.clear();
        Drained {
            writes: mem::take(&mut self.writes),
            reads: mem::take(&mut self.reads),
        }
    }

    /// The intent currently buffered for `key`
    pub fn write_intent(&self, key: &str) -> Option<&WriteIntent> {
        self.write_index.get(key).map(|&slot| &self.writes[slot].1.intent)
    }

    /// (write intents, read intents) currently buffered
    pub fn len(&self) -> (usize, usize) {
        (self.writes.len(), self.reads.len())
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.reads.is_empty()
    }
}
