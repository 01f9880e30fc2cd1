//! Last-synced base snapshots.
//!
//! The ledger remembers, per record, the last version the bridge
//! applied and when. It serves two purposes: duplicate deliveries are
//! recognized (applied timestamp is already at or past the event's),
//! and the resolver gets a real three-way base to diff against.

use crate::journal::BaseEntry;
use chrono::{DateTime, Utc};
use gesden_sync_protocol::{RecordKey, RecordPayload};
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// Shared map of last-synced snapshots.
#[derive(Debug, Default)]
pub struct BaseLedger {
    entries: RwLock<BTreeMap<RecordKey, BaseEntry>>,
}

impl BaseLedger {
    /// Creates an empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a ledger from recovered journal state.
    pub fn from_entries(entries: BTreeMap<RecordKey, BaseEntry>) -> Self {
        Self {
            entries: RwLock::new(entries),
        }
    }

    /// Returns the last synced snapshot for a record.
    pub fn get(&self, key: &RecordKey) -> Option<BaseEntry> {
        self.entries.read().get(key).cloned()
    }

    /// Returns the source timestamp of the last applied version.
    pub fn last_applied_ts(&self, key: &RecordKey) -> Option<DateTime<Utc>> {
        self.entries.read().get(key).map(|e| e.applied_ts)
    }

    /// Records an applied version (`None` payload after a delete).
    pub fn record_applied(
        &self,
        key: RecordKey,
        payload: Option<RecordPayload>,
        applied_ts: DateTime<Utc>,
    ) {
        self.entries.write().insert(
            key,
            BaseEntry {
                payload,
                applied_ts,
            },
        );
    }

    /// Exports all entries for journal compaction.
    pub fn export(&self) -> BTreeMap<RecordKey, BaseEntry> {
        self.entries.read().clone()
    }

    /// Number of tracked records.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if no record has been synced yet.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
