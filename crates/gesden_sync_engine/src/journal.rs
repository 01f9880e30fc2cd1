//! Durable operation journal.
//!
//! Every queue mutation is appended to a JSON-lines file before the
//! engine acknowledges it, so pending operations survive a crash.
//! Losing an enqueued operation means silent divergence between the
//! stores, which makes this file the principal correctness mechanism
//! of the whole bridge.
//!
//! ## Record format
//!
//! One JSON object per line, tagged by `type`:
//!
//! ```text
//! {"type":"enqueued","op":{...}}
//! {"type":"status_changed","op_id":7,"status":"applied",...}
//! {"type":"watermark","source":"postgres","sequence":42}
//! {"type":"base","key":{...},"payload":{...},"applied_ts":"..."}
//! {"type":"conflict","conflict":{...}}
//! {"type":"conflict_archived","id":"..."}
//! {"type":"next_op_id","next_op_id":8}
//! ```
//!
//! ## Recovery policy
//!
//! Replay folds records in order. A trailing line that fails to parse
//! is treated as a crash artifact mid-append and discarded; a corrupt
//! line anywhere else is fatal. In-flight operations are re-queued as
//! pending: apply is idempotent, so re-running one is safe.
//!
//! Compaction rewrites the live state (non-terminal operations,
//! watermarks, base snapshots) into a fresh file and atomically
//! renames it over the old one.

use crate::error::{EngineError, EngineResult};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use gesden_sync_protocol::{
    Conflict, OperationStatus, RecordKey, RecordPayload, StoreSide, SyncOperation,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};
use uuid::Uuid;

/// A single journal entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JournalRecord {
    /// An operation entered the queue.
    Enqueued {
        /// The operation as enqueued.
        op: SyncOperation,
    },
    /// An operation changed processing state.
    StatusChanged {
        /// The operation's id.
        op_id: u64,
        /// New status.
        status: OperationStatus,
        /// Attempts made so far.
        attempts: u32,
        /// Most recent failure message, if any.
        last_error: Option<String>,
    },
    /// A change feed confirmed consumption up to a sequence number.
    Watermark {
        /// The store the feed reads from.
        source: StoreSide,
        /// Highest consumed sequence number.
        sequence: u64,
    },
    /// The last synced version of a record was updated.
    Base {
        /// The record.
        key: RecordKey,
        /// Snapshot after apply; `None` after a delete.
        payload: Option<RecordPayload>,
        /// Source timestamp of the applied version.
        applied_ts: DateTime<Utc>,
    },
    /// A conflict was parked for manual review.
    Conflict {
        /// The unresolved conflict.
        conflict: Conflict,
    },
    /// A parked conflict was dealt with by an operator.
    ConflictArchived {
        /// The archived conflict's id.
        id: Uuid,
    },
    /// Cursor written during compaction so operation ids keep
    /// increasing even when no live operation carries the maximum.
    NextOpId {
        /// Next operation id to assign.
        next_op_id: u64,
    },
}

/// A record's last synced snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseEntry {
    /// Snapshot after the last apply; `None` after a delete.
    pub payload: Option<RecordPayload>,
    /// Source timestamp of the applied version.
    pub applied_ts: DateTime<Utc>,
}

/// State recovered from (or written into) a journal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JournalState {
    /// Live (non-terminal) operations, pending again after recovery.
    pub operations: Vec<SyncOperation>,
    /// Next operation id to assign.
    pub next_op_id: u64,
    /// Confirmed change feed positions.
    pub watermarks: BTreeMap<StoreSide, u64>,
    /// Last synced snapshots per record.
    pub bases: BTreeMap<RecordKey, BaseEntry>,
    /// Conflicts awaiting manual review.
    pub pending_conflicts: Vec<Conflict>,
    /// Operations that reached a terminal state since the last
    /// compaction (audit trail length).
    pub terminal_count: u64,
}

impl JournalState {
    /// Folds one record into the state.
    fn apply(&mut self, record: JournalRecord) {
        match record {
            JournalRecord::Enqueued { op } => {
                self.next_op_id = self.next_op_id.max(op.op_id + 1);
                self.operations.push(op);
            }
            JournalRecord::StatusChanged {
                op_id,
                status,
                attempts,
                last_error,
            } => {
                if status.is_terminal() {
                    self.operations.retain(|op| op.op_id != op_id);
                    self.terminal_count += 1;
                } else if let Some(op) = self.operations.iter_mut().find(|op| op.op_id == op_id) {
                    op.status = status;
                    op.attempts = attempts;
                    op.last_error = last_error;
                }
            }
            JournalRecord::Watermark { source, sequence } => {
                let entry = self.watermarks.entry(source).or_default();
                *entry = (*entry).max(sequence);
            }
            JournalRecord::Base {
                key,
                payload,
                applied_ts,
            } => {
                self.bases.insert(
                    key,
                    BaseEntry {
                        payload,
                        applied_ts,
                    },
                );
            }
            JournalRecord::Conflict { conflict } => {
                // At most one pending conflict per record; newer wins.
                self.pending_conflicts
                    .retain(|c| c.table != conflict.table || c.record_id != conflict.record_id);
                self.pending_conflicts.push(conflict);
            }
            JournalRecord::ConflictArchived { id } => {
                self.pending_conflicts.retain(|c| c.id != id);
            }
            JournalRecord::NextOpId { next_op_id } => {
                self.next_op_id = self.next_op_id.max(next_op_id);
            }
        }
    }

    /// Finishes recovery: in-flight operations go back to pending.
    fn finish(&mut self) {
        if self.next_op_id == 0 {
            self.next_op_id = 1;
        }
        for op in &mut self.operations {
            if op.status == OperationStatus::InFlight {
                op.status = OperationStatus::Pending;
            }
        }
    }
}

/// Append-only JSON-lines journal with exclusive file locking.
#[derive(Debug)]
pub struct Journal {
    path: PathBuf,
    file: Mutex<File>,
    records_since_compact: AtomicUsize,
}

impl Journal {
    /// Opens (creating if needed) a journal, takes the exclusive
    /// lock, and replays existing records.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be opened or locked, or if a
    /// non-trailing line is corrupt.
    pub fn open(path: impl Into<PathBuf>) -> EngineResult<(Self, JournalState)> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&path)?;

        file.try_lock_exclusive()
            .map_err(|e| EngineError::JournalLocked(e.to_string()))?;

        let state = replay(&path)?;
        debug!(
            path = %path.display(),
            live_ops = state.operations.len(),
            terminal = state.terminal_count,
            "journal opened"
        );

        Ok((
            Self {
                path,
                file: Mutex::new(file),
                records_since_compact: AtomicUsize::new(
                    state.operations.len() + state.terminal_count as usize,
                ),
            },
            state,
        ))
    }

    /// Appends a record and syncs it to disk before returning.
    pub fn append(&self, record: &JournalRecord) -> EngineResult<()> {
        let line = serde_json::to_string(record).map_err(gesden_sync_protocol::ProtocolError::from)?;
        let mut file = self.file.lock();
        writeln!(file, "{line}")?;
        file.sync_data()?;
        self.records_since_compact.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Number of records appended since the last compaction (or open).
    pub fn records_since_compact(&self) -> usize {
        self.records_since_compact.load(Ordering::Relaxed)
    }

    /// Rewrites the journal to contain exactly the given live state,
    /// atomically replacing the old file.
    pub fn compact(&self, state: &JournalState) -> EngineResult<()> {
        let tmp_path = self.path.with_extension("tmp");
        let mut guard = self.file.lock();

        {
            let mut tmp = File::create(&tmp_path)?;
            write_record(
                &mut tmp,
                &JournalRecord::NextOpId {
                    next_op_id: state.next_op_id,
                },
            )?;
            for op in &state.operations {
                write_record(&mut tmp, &JournalRecord::Enqueued { op: op.clone() })?;
            }
            for (source, sequence) in &state.watermarks {
                write_record(
                    &mut tmp,
                    &JournalRecord::Watermark {
                        source: *source,
                        sequence: *sequence,
                    },
                )?;
            }
            for (key, base) in &state.bases {
                write_record(
                    &mut tmp,
                    &JournalRecord::Base {
                        key: key.clone(),
                        payload: base.payload.clone(),
                        applied_ts: base.applied_ts,
                    },
                )?;
            }
            for conflict in &state.pending_conflicts {
                write_record(
                    &mut tmp,
                    &JournalRecord::Conflict {
                        conflict: conflict.clone(),
                    },
                )?;
            }
            tmp.sync_all()?;
        }

        std::fs::rename(&tmp_path, &self.path)?;

        let file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        file.try_lock_exclusive()
            .map_err(|e| EngineError::JournalLocked(e.to_string()))?;
        *guard = file;

        self.records_since_compact.store(0, Ordering::Relaxed);
        debug!(path = %self.path.display(), "journal compacted");
        Ok(())
    }

    /// Returns the journal path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn write_record(file: &mut File, record: &JournalRecord) -> EngineResult<()> {
    let line = serde_json::to_string(record).map_err(gesden_sync_protocol::ProtocolError::from)?;
    writeln!(file, "{line}")?;
    Ok(())
}

/// Replays a journal file without taking the writer lock.
///
/// Used by the CLI inspection tools as well as [`Journal::open`].
pub fn replay(path: &Path) -> EngineResult<JournalState> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);

    let lines: Vec<String> = reader.lines().collect::<Result<_, _>>()?;
    let last_index = lines.len().saturating_sub(1);

    let mut state = JournalState::default();
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalRecord>(line) {
            Ok(record) => state.apply(record),
            Err(e) if index == last_index => {
                // Crash artifact mid-append; drop it and continue.
                warn!(line = index + 1, error = %e, "discarding truncated journal tail");
                break;
            }
            Err(e) => {
                return Err(EngineError::JournalCorrupt {
                    line: index + 1,
                    message: e.to_string(),
                });
            }
        }
    }

    state.finish();
    Ok(state)
}
