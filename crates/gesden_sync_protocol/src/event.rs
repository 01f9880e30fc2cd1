//! Change events emitted by the store change feeds.

use crate::error::ProtocolError;
use crate::record::RecordPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The two stores the bridge synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreSide {
    /// The legacy on-premise GESDEN SQL Server store.
    SqlServer,
    /// The Postgres store backing the clinic application.
    Postgres,
}

impl StoreSide {
    /// Returns the opposite store, i.e. the target of a change from this side.
    pub fn opposite(&self) -> Self {
        match self {
            StoreSide::SqlServer => StoreSide::Postgres,
            StoreSide::Postgres => StoreSide::SqlServer,
        }
    }
}

impl fmt::Display for StoreSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreSide::SqlServer => write!(f, "sql_server"),
            StoreSide::Postgres => write!(f, "postgres"),
        }
    }
}

/// The tables kept in sync between the two stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTable {
    /// Patient master records.
    Pacientes,
    /// Appointments.
    Citas,
    /// Practitioner records.
    Doctores,
}

impl SyncTable {
    /// All synchronized tables.
    pub const ALL: [SyncTable; 3] = [SyncTable::Pacientes, SyncTable::Citas, SyncTable::Doctores];

    /// Returns the table name as used by both stores.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTable::Pacientes => "pacientes",
            SyncTable::Citas => "citas",
            SyncTable::Doctores => "doctores",
        }
    }

    /// Fields that must never be auto-resolved during conflict
    /// resolution: clinical-safety data and monetary amounts.
    pub fn safety_fields(&self) -> &'static [&'static str] {
        match self {
            SyncTable::Pacientes => &["alergias", "medicacion"],
            SyncTable::Citas => &["importe_cents"],
            SyncTable::Doctores => &[],
        }
    }
}

impl fmt::Display for SyncTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncTable {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pacientes" => Ok(SyncTable::Pacientes),
            "citas" => Ok(SyncTable::Citas),
            "doctores" => Ok(SyncTable::Doctores),
            other => Err(ProtocolError::UnknownTable(other.to_string())),
        }
    }
}

/// Identifies a single record across both stores.
///
/// `(table, record_id)` is the natural key the queue sequences on:
/// operations for the same key are applied in order, operations for
/// different keys may interleave freely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    /// The table the record belongs to.
    pub table: SyncTable,
    /// The record's id, shared by both stores.
    pub record_id: String,
}

impl RecordKey {
    /// Creates a new record key.
    pub fn new(table: SyncTable, record_id: impl Into<String>) -> Self {
        Self {
            table,
            record_id: record_id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.table, self.record_id)
    }
}

/// Kind of change observed in a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    /// Record was inserted or updated.
    Upsert,
    /// Record was deleted.
    Delete,
}

/// A single row-level change observed in one store's change feed.
///
/// Events are immutable once enqueued. Duplicate observations of the
/// same change (at-least-once feeds) are identified by
/// `(table, record_id, source_ts)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// The store the change originated from.
    pub source: StoreSide,
    /// The table the change affects.
    pub table: SyncTable,
    /// The changed record's id.
    pub record_id: String,
    /// Upsert or delete.
    pub kind: ChangeKind,
    /// Snapshot of the record after the change (absent for deletes).
    pub payload: Option<RecordPayload>,
    /// When the change was committed in the source store.
    pub source_ts: DateTime<Utc>,
    /// Monotonic per-store sequence number (the watermark unit).
    pub sequence: u64,
}

impl ChangeEvent {
    /// Creates an upsert event carrying a record snapshot.
    pub fn upsert(
        source: StoreSide,
        payload: RecordPayload,
        source_ts: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            source,
            table: payload.table(),
            record_id: payload.id().to_string(),
            kind: ChangeKind::Upsert,
            payload: Some(payload),
            source_ts,
            sequence,
        }
    }

    /// Creates a delete event.
    pub fn delete(
        source: StoreSide,
        table: SyncTable,
        record_id: impl Into<String>,
        source_ts: DateTime<Utc>,
        sequence: u64,
    ) -> Self {
        Self {
            source,
            table,
            record_id: record_id.into(),
            kind: ChangeKind::Delete,
            payload: None,
            source_ts,
            sequence,
        }
    }

    /// Returns the record key this event belongs to.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table, self.record_id.clone())
    }

    /// Returns the key used to drop duplicate feed observations.
    pub fn dedupe_key(&self) -> (RecordKey, DateTime<Utc>) {
        (self.key(), self.source_ts)
    }

    /// Returns the store this event must be applied to.
    pub fn target(&self) -> StoreSide {
        self.source.opposite()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PatientRecord;
    use chrono::TimeZone;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn opposite_store() {
        assert_eq!(StoreSide::SqlServer.opposite(), StoreSide::Postgres);
        assert_eq!(StoreSide::Postgres.opposite(), StoreSide::SqlServer);
    }

    #[test]
    fn table_parse_roundtrip() {
        for table in SyncTable::ALL {
            assert_eq!(table.as_str().parse::<SyncTable>().unwrap(), table);
        }
        assert!("facturas".parse::<SyncTable>().is_err());
    }

    #[test]
    fn safety_fields_cover_clinical_data() {
        assert!(SyncTable::Pacientes.safety_fields().contains(&"alergias"));
        assert!(SyncTable::Pacientes.safety_fields().contains(&"medicacion"));
        assert!(SyncTable::Citas.safety_fields().contains(&"importe_cents"));
        assert!(SyncTable::Doctores.safety_fields().is_empty());
    }

    #[test]
    fn upsert_event_derives_key_from_payload() {
        let patient = PatientRecord::new("p-1", "Ana", "García", ts(100));
        let event = ChangeEvent::upsert(
            StoreSide::SqlServer,
            RecordPayload::Pacientes(patient),
            ts(100),
            7,
        );

        assert_eq!(event.table, SyncTable::Pacientes);
        assert_eq!(event.record_id, "p-1");
        assert_eq!(event.kind, ChangeKind::Upsert);
        assert_eq!(event.target(), StoreSide::Postgres);
        assert_eq!(event.key(), RecordKey::new(SyncTable::Pacientes, "p-1"));
    }

    #[test]
    fn delete_event_has_no_payload() {
        let event = ChangeEvent::delete(StoreSide::Postgres, SyncTable::Citas, "c-9", ts(50), 3);
        assert_eq!(event.kind, ChangeKind::Delete);
        assert!(event.payload.is_none());
        assert_eq!(event.target(), StoreSide::SqlServer);
    }

    #[test]
    fn event_json_roundtrip() {
        let event = ChangeEvent::delete(StoreSide::Postgres, SyncTable::Doctores, "d-2", ts(9), 1);
        let json = serde_json::to_string(&event).unwrap();
        let back: ChangeEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
