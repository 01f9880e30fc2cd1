//! Status API request and response messages.
//!
//! All bodies are JSON. The server crate dispatches on method + path
//! and decodes these types; whatever HTTP stack embeds the server
//! only moves opaque byte bodies around.

use crate::conflict::ConflictSummary;
use crate::event::{StoreSide, SyncTable};
use crate::health::{Alert, AlertKind, AlertStatus, HealthSnapshot, StatsSnapshot};
use serde::{Deserialize, Serialize};

/// Body of `POST /sync/force`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceSyncRequest {
    /// Restrict reconciliation to a single table; all tables if absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<SyncTable>,
}

/// Response of `POST /sync/force`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForceSyncReport {
    /// Records compared across both stores.
    pub examined: u64,
    /// Reconciliation operations enqueued.
    pub enqueued: u64,
    /// Records skipped because an operation for their key was already
    /// queued or in flight.
    pub skipped_in_flight: u64,
    /// Wall time of the reconciliation pass in milliseconds.
    pub duration_ms: u64,
}

/// Change feed progress for one store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkInfo {
    /// The store the feed reads from.
    pub source: StoreSide,
    /// Highest sequence number confirmed consumed.
    pub watermark: u64,
}

/// Response of `GET /sync/status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Engine lifecycle state (`idle`, `running`, `stopping`, `stopped`).
    pub engine_state: String,
    /// Rolling operation counters.
    pub stats: StatsSnapshot,
    /// Per-component health and the derived overall level.
    pub health: HealthSnapshot,
    /// Conflict counts.
    pub conflicts: ConflictSummary,
    /// Operations currently queued or in flight.
    pub pending_operations: u64,
    /// Change feed progress per store.
    pub watermarks: Vec<WatermarkInfo>,
}

/// Parsed query of `GET /alerts`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlertQuery {
    /// Filter by lifecycle state.
    pub status: Option<AlertStatus>,
    /// Filter by kind.
    pub kind: Option<AlertKind>,
}

/// Response of `GET /alerts`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertListResponse {
    /// Alerts matching the query, newest first.
    pub alerts: Vec<Alert>,
}

/// Response of `POST /alerts/{id}/acknowledge` and `/resolve`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertActionResponse {
    /// The alert after the action.
    pub alert: Alert,
}
