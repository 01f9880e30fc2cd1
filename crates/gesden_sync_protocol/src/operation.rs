//! Queued sync operations and their lifecycle.

use crate::event::{ChangeEvent, RecordKey, StoreSide};
use serde::{Deserialize, Serialize};

/// Processing state of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting in the queue.
    Pending,
    /// Handed to a worker, not yet terminal.
    InFlight,
    /// Applied to the target store.
    Applied,
    /// Ended in a conflict awaiting manual resolution.
    Conflicted,
    /// Retries exhausted or fatal data error.
    Failed,
}

impl OperationStatus {
    /// Returns true if the operation will not be processed again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OperationStatus::Applied | OperationStatus::Conflicted | OperationStatus::Failed
        )
    }
}

/// A change event together with its processing state.
///
/// Created when an event is enqueued, mutated only by the executor,
/// retained in the journal until terminal for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncOperation {
    /// Queue-assigned operation id, monotonically increasing.
    pub op_id: u64,
    /// The change being replicated.
    pub event: ChangeEvent,
    /// Current processing state.
    pub status: OperationStatus,
    /// Number of apply attempts so far.
    pub attempts: u32,
    /// Message of the most recent failure, if any.
    pub last_error: Option<String>,
}

impl SyncOperation {
    /// Wraps an event as a freshly enqueued operation.
    pub fn new(op_id: u64, event: ChangeEvent) -> Self {
        Self {
            op_id,
            event,
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
        }
    }

    /// Returns the record key this operation sequences on.
    pub fn key(&self) -> RecordKey {
        self.event.key()
    }

    /// Returns the store this operation applies to.
    pub fn target(&self) -> StoreSide {
        self.event.target()
    }
}
