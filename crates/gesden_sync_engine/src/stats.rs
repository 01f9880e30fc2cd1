//! Process-wide rolling sync counters.

use gesden_sync_protocol::StatsSnapshot;
use std::sync::atomic::{AtomicU64, Ordering};

/// Rolling counters shared by all workers; reset only on restart.
///
/// Workers update these concurrently, so every counter is an atomic
/// and no lock is held while counting.
#[derive(Debug, Default)]
pub struct SyncStats {
    total_operations: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    conflicts: AtomicU64,
    merged: AtomicU64,
    active_connections: AtomicU64,
}

impl SyncStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an operation handed to a worker.
    pub fn record_dequeued(&self) {
        self.total_operations.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful apply.
    pub fn record_applied(&self) {
        self.successful.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a terminal failure.
    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a detected conflict (auto-resolved or manual).
    pub fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a disjoint-field merge.
    pub fn record_merged(&self) {
        self.merged.fetch_add(1, Ordering::Relaxed);
    }

    /// Sets the number of currently connected store links.
    pub fn set_active_connections(&self, count: u64) {
        self.active_connections.store(count, Ordering::Relaxed);
    }

    /// Takes a consistent-enough snapshot for the status API.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total_operations: self.total_operations.load(Ordering::Relaxed),
            successful: self.successful.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            merged: self.merged.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = SyncStats::new();
        stats.record_dequeued();
        stats.record_dequeued();
        stats.record_applied();
        stats.record_failed();
        stats.record_conflict();
        stats.record_merged();
        stats.set_active_connections(2);

        let snap = stats.snapshot();
        assert_eq!(snap.total_operations, 2);
        assert_eq!(snap.successful, 1);
        assert_eq!(snap.failed, 1);
        assert_eq!(snap.conflicts, 1);
        assert_eq!(snap.merged, 1);
        assert_eq!(snap.active_connections, 2);
    }
}
