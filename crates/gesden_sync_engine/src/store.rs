//! Store client abstraction.
//!
//! Both stores are consumed through the same capability trait; the
//! engine is constructed with its two clients rather than looking them
//! up through globals. Real adapters wrap a SQL Server or Postgres
//! driver; [`MemoryStore`] backs tests and loopback demos.

use crate::error::StoreError;
use gesden_sync_protocol::{
    ChangeEvent, ConnectionState, RecordKey, RecordPayload, StoreSide, SyncTable,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Capability interface over one of the two stores.
///
/// Implementations enforce the configured per-call timeout themselves
/// (drivers expose this natively) and surface overruns as
/// [`StoreError::Timeout`]. `apply_upsert`/`apply_delete` must wrap
/// the write in a transaction scoped to that single record.
pub trait StoreClient: Send + Sync + 'static {
    /// Which side of the bridge this client talks to.
    fn side(&self) -> StoreSide;

    /// Establishes (or re-establishes) the connection.
    fn connect(&self) -> Result<(), StoreError>;

    /// Fetches the current version of a record, if present.
    fn fetch(&self, key: &RecordKey) -> Result<Option<RecordPayload>, StoreError>;

    /// Returns every record of a table; used by force sync.
    fn scan(&self, table: SyncTable) -> Result<Vec<RecordPayload>, StoreError>;

    /// Returns changes with sequence numbers above the watermark,
    /// in sequence order.
    fn poll_changes(&self, watermark: u64) -> Result<Vec<ChangeEvent>, StoreError>;

    /// Writes a record version inside a single-record transaction.
    fn apply_upsert(&self, payload: &RecordPayload) -> Result<(), StoreError>;

    /// Deletes a record inside a single-record transaction.
    fn apply_delete(&self, key: &RecordKey) -> Result<(), StoreError>;
}

/// Tracks the connection state of one store link.
///
/// Replaces callback-based connection events with an explicit state
/// machine; every transition is logged and surfaced through the
/// health snapshot.
#[derive(Debug)]
pub struct ConnectionTracker {
    side: StoreSide,
    state: RwLock<ConnectionState>,
}

impl ConnectionTracker {
    /// Creates a tracker starting in `Disconnected`.
    pub fn new(side: StoreSide) -> Self {
        Self {
            side,
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    /// Returns the current state.
    pub fn state(&self) -> ConnectionState {
        *self.state.read()
    }

    /// Transitions to a new state, logging the edge.
    pub fn transition(&self, to: ConnectionState) {
        let mut state = self.state.write();
        if *state == to {
            return;
        }
        info!(store = %self.side, from = ?*state, to = ?to, "connection state changed");
        *state = to;
    }
}

/// An in-memory store implementing the full capability trait.
///
/// Local application writes go through [`MemoryStore::write_local`] /
/// [`MemoryStore::delete_local`], which also emit change feed events.
/// Writes performed by the bridge (`apply_*`) do not re-emit events;
/// real adapters achieve the same by filtering changes made under the
/// bridge's session user.
pub struct MemoryStore {
    side: StoreSide,
    records: RwLock<BTreeMap<RecordKey, RecordPayload>>,
    feed: RwLock<Vec<ChangeEvent>>,
    next_sequence: AtomicU64,
    fail_mode: RwLock<Option<StoreError>>,
}

impl MemoryStore {
    /// Creates an empty store for the given side.
    pub fn new(side: StoreSide) -> Self {
        Self {
            side,
            records: RwLock::new(BTreeMap::new()),
            feed: RwLock::new(Vec::new()),
            next_sequence: AtomicU64::new(1),
            fail_mode: RwLock::new(None),
        }
    }

    /// Simulates a local application write: stores the record and
    /// emits an upsert change event stamped with the payload's
    /// `updated_at`.
    pub fn write_local(&self, payload: RecordPayload) -> ChangeEvent {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let event = ChangeEvent::upsert(self.side, payload.clone(), payload.updated_at(), sequence);
        self.records
            .write()
            .insert(RecordKey::new(payload.table(), payload.id()), payload);
        self.feed.write().push(event.clone());
        event
    }

    /// Simulates a local delete, emitting a delete change event.
    pub fn delete_local(
        &self,
        key: &RecordKey,
        deleted_at: chrono::DateTime<chrono::Utc>,
    ) -> ChangeEvent {
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let event = ChangeEvent::delete(
            self.side,
            key.table,
            key.record_id.clone(),
            deleted_at,
            sequence,
        );
        self.records.write().remove(key);
        self.feed.write().push(event.clone());
        event
    }

    /// Inserts a record without emitting a feed event; used to seed
    /// pre-existing state.
    pub fn seed(&self, payload: RecordPayload) {
        self.records
            .write()
            .insert(RecordKey::new(payload.table(), payload.id()), payload);
    }

    /// Makes every subsequent call fail with the given error until
    /// cleared with `None`.
    pub fn set_fail_mode(&self, error: Option<StoreError>) {
        *self.fail_mode.write() = error;
    }

    /// Returns the current version of a record (test accessor).
    pub fn get(&self, key: &RecordKey) -> Option<RecordPayload> {
        self.records.read().get(key).cloned()
    }

    /// Returns the number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn check_fail(&self) -> Result<(), StoreError> {
        match &*self.fail_mode.read() {
            Some(e) => Err(e.clone()),
            None => Ok(()),
        }
    }
}

impl StoreClient for MemoryStore {
    fn side(&self) -> StoreSide {
        self.side
    }

    fn connect(&self) -> Result<(), StoreError> {
        self.check_fail()
    }

    fn fetch(&self, key: &RecordKey) -> Result<Option<RecordPayload>, StoreError> {
        self.check_fail()?;
        Ok(self.records.read().get(key).cloned())
    }

    fn scan(&self, table: SyncTable) -> Result<Vec<RecordPayload>, StoreError> {
        self.check_fail()?;
        Ok(self
            .records
            .read()
            .iter()
            .filter(|(key, _)| key.table == table)
            .map(|(_, payload)| payload.clone())
            .collect())
    }

    fn poll_changes(&self, watermark: u64) -> Result<Vec<ChangeEvent>, StoreError> {
        self.check_fail()?;
        Ok(self
            .feed
            .read()
            .iter()
            .filter(|e| e.sequence > watermark)
            .cloned()
            .collect())
    }

    fn apply_upsert(&self, payload: &RecordPayload) -> Result<(), StoreError> {
        self.check_fail()?;
        self.records.write().insert(
            RecordKey::new(payload.table(), payload.id()),
            payload.clone(),
        );
        Ok(())
    }

    fn apply_delete(&self, key: &RecordKey) -> Result<(), StoreError> {
        self.check_fail()?;
        // Deleting an absent record is a no-op, not an error.
        self.records.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use gesden_sync_protocol::{ChangeKind, PatientRecord};

    fn patient(id: &str, secs: i64) -> RecordPayload {
        RecordPayload::Pacientes(PatientRecord::new(
            id,
            "Ana",
            "García",
            Utc.timestamp_opt(secs, 0).unwrap(),
        ))
    }

    #[test]
    fn local_writes_emit_feed_events() {
        let store = MemoryStore::new(StoreSide::SqlServer);

        store.write_local(patient("p-1", 10));
        store.write_local(patient("p-2", 20));

        let changes = store.poll_changes(0).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].sequence, 1);
        assert_eq!(changes[1].sequence, 2);
        assert_eq!(changes[0].kind, ChangeKind::Upsert);
    }

    #[test]
    fn bridge_writes_do_not_echo() {
        let store = MemoryStore::new(StoreSide::Postgres);

        store.apply_upsert(&patient("p-1", 10)).unwrap();
        assert_eq!(store.len(), 1);
        assert!(store.poll_changes(0).unwrap().is_empty());
    }

    #[test]
    fn poll_respects_watermark() {
        let store = MemoryStore::new(StoreSide::SqlServer);
        store.write_local(patient("p-1", 10));
        store.write_local(patient("p-2", 20));
        store.write_local(patient("p-3", 30));

        let changes = store.poll_changes(2).unwrap();
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].record_id, "p-3");
    }

    #[test]
    fn fail_mode_propagates() {
        let store = MemoryStore::new(StoreSide::Postgres);
        store.set_fail_mode(Some(StoreError::Transient("connection refused".into())));

        assert!(store.poll_changes(0).is_err());
        assert!(store.fetch(&RecordKey::new(SyncTable::Pacientes, "p-1")).is_err());

        store.set_fail_mode(None);
        assert!(store.poll_changes(0).is_ok());
    }

    #[test]
    fn connection_tracker_logs_transitions() {
        let tracker = ConnectionTracker::new(StoreSide::SqlServer);
        assert_eq!(tracker.state(), ConnectionState::Disconnected);

        tracker.transition(ConnectionState::Connecting);
        tracker.transition(ConnectionState::Connected);
        assert_eq!(tracker.state(), ConnectionState::Connected);

        tracker.transition(ConnectionState::Reconnecting);
        assert_eq!(tracker.state(), ConnectionState::Reconnecting);
    }
}
