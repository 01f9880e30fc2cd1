//! Durable, per-key ordered operation queue.
//!
//! Operations for the same `(table, record_id)` key are delivered to
//! workers in source-timestamp order, one at a time; operations for
//! different keys interleave freely. Every mutation is journaled
//! before it takes effect in memory.

use crate::error::EngineResult;
use crate::journal::{BaseEntry, Journal, JournalRecord, JournalState};
use chrono::{DateTime, Utc};
use gesden_sync_protocol::{
    ChangeEvent, Conflict, OperationStatus, RecordKey, StoreSide, SyncOperation,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

struct QueueInner {
    /// Operation ids per key, kept in source-timestamp order.
    by_key: BTreeMap<RecordKey, VecDeque<u64>>,
    /// Live operations by id.
    ops: BTreeMap<u64, SyncOperation>,
    /// Keys currently handed to a worker.
    in_flight: BTreeSet<RecordKey>,
    /// Identities of events already accepted (duplicate suppression).
    seen: BTreeSet<(RecordKey, DateTime<Utc>)>,
    next_op_id: u64,
}

/// The shared operation queue.
pub struct OperationQueue {
    inner: Mutex<QueueInner>,
    journal: Arc<Journal>,
}

impl OperationQueue {
    /// Builds a queue from recovered journal state.
    pub fn new(journal: Arc<Journal>, state: &JournalState) -> Self {
        let mut inner = QueueInner {
            by_key: BTreeMap::new(),
            ops: BTreeMap::new(),
            in_flight: BTreeSet::new(),
            seen: BTreeSet::new(),
            next_op_id: state.next_op_id,
        };

        let mut recovered: Vec<&SyncOperation> = state.operations.iter().collect();
        recovered.sort_by_key(|op| (op.event.source_ts, op.op_id));
        for op in recovered {
            inner.seen.insert(op.event.dedupe_key());
            inner
                .by_key
                .entry(op.key())
                .or_default()
                .push_back(op.op_id);
            inner.ops.insert(op.op_id, op.clone());
        }

        Self {
            inner: Mutex::new(inner),
            journal,
        }
    }

    /// Enqueues a change event.
    ///
    /// Returns the assigned operation id, or `None` if the event is a
    /// duplicate observation of one already accepted. The journal
    /// append happens before the in-memory insert.
    pub fn enqueue(&self, event: ChangeEvent) -> EngineResult<Option<u64>> {
        let mut inner = self.inner.lock();

        let dedupe_key = event.dedupe_key();
        if inner.seen.contains(&dedupe_key) {
            return Ok(None);
        }

        let op_id = inner.next_op_id;
        let op = SyncOperation::new(op_id, event);

        self.journal
            .append(&JournalRecord::Enqueued { op: op.clone() })?;

        inner.next_op_id += 1;
        inner.seen.insert(dedupe_key);

        // Keep the per-key deque in source-timestamp order even if
        // feeds deliver slightly out of order across stores.
        let key = op.key();
        let ts = op.event.source_ts;
        let pos = match inner.by_key.get(&key) {
            Some(deque) => {
                deque.len()
                    - deque
                        .iter()
                        .rev()
                        .take_while(|id| {
                            inner
                                .ops
                                .get(*id)
                                .map(|existing| existing.event.source_ts > ts)
                                .unwrap_or(false)
                        })
                        .count()
            }
            None => 0,
        };
        inner.ops.insert(op_id, op);
        inner.by_key.entry(key).or_default().insert(pos, op_id);

        debug!(op_id, "operation enqueued");
        Ok(Some(op_id))
    }

    /// Hands the next runnable operation to a worker.
    ///
    /// Returns the oldest pending operation whose key has no
    /// operation in flight, marking it in flight.
    pub fn dequeue_next(&self) -> EngineResult<Option<SyncOperation>> {
        let mut inner = self.inner.lock();

        let mut candidate: Option<(RecordKey, u64)> = None;
        for (key, deque) in &inner.by_key {
            if inner.in_flight.contains(key) {
                continue;
            }
            if let Some(&front) = deque.front() {
                candidate = Some((key.clone(), front));
                break;
            }
        }

        let Some((key, op_id)) = candidate else {
            return Ok(None);
        };

        self.journal.append(&JournalRecord::StatusChanged {
            op_id,
            status: OperationStatus::InFlight,
            attempts: 0,
            last_error: None,
        })?;

        inner.in_flight.insert(key);
        let op = inner
            .ops
            .get_mut(&op_id)
            .map(|op| {
                op.status = OperationStatus::InFlight;
                op.clone()
            });

        Ok(op)
    }

    /// Completes an in-flight operation with a terminal status,
    /// releasing its key for the next operation.
    pub fn complete(
        &self,
        op_id: u64,
        status: OperationStatus,
        attempts: u32,
        last_error: Option<String>,
    ) -> EngineResult<()> {
        debug_assert!(status.is_terminal());

        let mut inner = self.inner.lock();

        self.journal.append(&JournalRecord::StatusChanged {
            op_id,
            status,
            attempts,
            last_error,
        })?;

        if let Some(op) = inner.ops.remove(&op_id) {
            let key = op.key();
            if let Some(deque) = inner.by_key.get_mut(&key) {
                deque.retain(|id| *id != op_id);
                if deque.is_empty() {
                    inner.by_key.remove(&key);
                }
            }
            inner.in_flight.remove(&key);
            // The event identity can recur once its operation is done;
            // the base ledger makes a replayed apply a no-op.
            inner.seen.remove(&op.event.dedupe_key());
        }
        Ok(())
    }

    /// Rewrites the journal down to live state.
    ///
    /// Holds the queue lock across the rewrite so an enqueue cannot
    /// land in the old file after the snapshot was taken and then be
    /// dropped with it.
    pub fn compact(
        &self,
        watermarks: BTreeMap<StoreSide, u64>,
        bases: BTreeMap<RecordKey, BaseEntry>,
        pending_conflicts: Vec<Conflict>,
    ) -> EngineResult<()> {
        let inner = self.inner.lock();
        let live = JournalState {
            operations: inner.ops.values().cloned().collect(),
            next_op_id: inner.next_op_id,
            watermarks,
            bases,
            pending_conflicts,
            terminal_count: 0,
        };
        self.journal.compact(&live)
    }

    /// Returns true if any operation for the key is queued or in flight.
    pub fn has_key(&self, key: &RecordKey) -> bool {
        let inner = self.inner.lock();
        inner.by_key.contains_key(key) || inner.in_flight.contains(key)
    }

    /// Operations queued or in flight.
    pub fn live_count(&self) -> usize {
        self.inner.lock().ops.len()
    }

    /// Snapshot of live operations, for compaction and inspection.
    pub fn live_operations(&self) -> Vec<SyncOperation> {
        self.inner.lock().ops.values().cloned().collect()
    }

    /// The next operation id the queue will assign.
    pub fn next_op_id(&self) -> u64 {
        self.inner.lock().next_op_id
    }
}
