//! Cache statistics

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of a cache instance's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Coalesced batches dispatched by the flush executor
    pub flushes: u64,
    /// Backend operations dispatched across flushes and bulk deletes
    pub operations: u64,
    /// Write intents replaced before they reached the backend
    pub writes_superseded: u64,
    /// Reads that joined an already-pending read of the same key
    pub reads_coalesced: u64,
    /// Operations the backend reported as failed
    pub operation_failures: u64,
    /// Reads whose stored blob did not decode
    pub decode_failures: u64,
    /// Bulk delete round trips
    pub bulk_deletes: u64,
}

impl CacheStats {
    /// Backend round trips: coalesced flushes plus bulk deletes
    pub fn round_trips(&self) -> u64 {
        self.flushes + self.bulk_deletes
    }

    /// Mean operations per backend round trip
    pub fn average_batch_size(&self) -> f64 {
        match self.round_trips() {
            0 => 0.0,
            trips => self.operations as f64 / trips as f64,
        }
    }
}

/// Live counters behind `CacheStats`
#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    flushes: AtomicU64,
    operations: AtomicU64,
    writes_superseded: AtomicU64,
    reads_coalesced: AtomicU64,
    operation_failures: AtomicU64,
    decode_failures: AtomicU64,
    bulk_deletes: AtomicU64,
}

impl StatsCounters {
    pub fn record_flush(&self, ops: usize) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.operations.fetch_add(ops as u64, Ordering::Relaxed);
    }

    pub fn record_superseded(&self) {
        self.writes_superseded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_read_coalesced(&self) {
        self.reads_coalesced.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.operation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_decode_failure(&self) {
        self.decode_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bulk_delete(&self, ops: usize) {
        self.bulk_deletes.fetch_add(1, Ordering::Relaxed);
        self.operations.fetch_add(ops as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            operations: self.operations.load(Ordering::Relaxed),
            writes_superseded: self.writes_superseded.load(Ordering::Relaxed),
            reads_coalesced: self.reads_coalesced.load(Ordering::Relaxed),
            operation_failures: self.operation_failures.load(Ordering::Relaxed),
            decode_failures: self.decode_failures.load(Ordering::Relaxed),
            bulk_deletes: self.bulk_deletes.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_average_batch_size() {
        let counters = StatsCounters::default();
        assert_eq!(counters.snapshot().average_batch_size(), 0.0);

        counters.record_flush(3);
        counters.record_flush(5);
        let stats = counters.snapshot();
        assert_eq!(stats.flushes, 2);
        assert_eq!(stats.operations, 8);
        assert_eq!(stats.average_batch_size(), 4.0);
    }

    #[test]
    fn test_bulk_deletes_count_as_round_trips() {
        let counters = StatsCounters::default();
        counters.record_flush(2);
        counters.record_bulk_delete(10);

        let stats = counters.snapshot();
        assert_eq!(stats.flushes, 1);
        assert_eq!(stats.bulk_deletes, 1);
        assert_eq!(stats.operations, 12);
        assert_eq!(stats.round_trips(), 2);
        assert_eq!(stats.average_batch_size(), 6.0);
    }
}
