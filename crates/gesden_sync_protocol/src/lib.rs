//! # GESDEN Sync Protocol
//!
//! Record schemas and wire types for the GESDEN sync bridge.
//!
//! This crate provides:
//! - Typed per-table record schemas with explicit field diff and merge
//! - `ChangeEvent` for change feed entries
//! - `SyncOperation` for queued work and its lifecycle
//! - `Conflict` for divergent concurrent writes
//! - Health, stats and alert types for the status API
//! - Status API request/response messages (JSON)
//!
//! This is a pure data crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod error;
mod event;
mod health;
mod messages;
mod operation;
mod record;

pub use conflict::{Conflict, ConflictSummary, ResolutionStrategy, ResolvedBy};
pub use error::{ProtocolError, ProtocolResult};
pub use event::{ChangeEvent, ChangeKind, RecordKey, StoreSide, SyncTable};
pub use health::{
    Alert, AlertKind, AlertSeverity, AlertStatus, ComponentHealth, ComponentId, ConnectionState,
    HealthLevel, HealthSnapshot, StatsSnapshot,
};
pub use messages::{
    AlertActionResponse, AlertListResponse, AlertQuery, ForceSyncReport, ForceSyncRequest,
    StatusResponse, WatermarkInfo,
};
pub use operation::{OperationStatus, SyncOperation};
pub use record::{AppointmentRecord, DoctorRecord, PatientRecord, RecordPayload};
