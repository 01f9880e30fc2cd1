//! Conflicts between divergent concurrent writes.

use crate::event::{RecordKey, SyncTable};
use crate::record::RecordPayload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Strategy used (or required) to resolve a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Later source timestamp wins; Postgres wins exact ties.
    LastWriterWins,
    /// Disjoint changed-field sets merged, no version discarded.
    FieldMerge,
    /// The SQL Server version wins.
    PreferSqlServer,
    /// The Postgres version wins.
    PreferPostgres,
    /// Requires a human decision.
    Manual,
}

impl ResolutionStrategy {
    /// Returns true if this strategy resolves without human input.
    pub fn auto_resolves(&self) -> bool {
        !matches!(self, ResolutionStrategy::Manual)
    }
}

/// Who resolved (or must resolve) a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolvedBy {
    /// Resolved by the engine without human input.
    Auto,
    /// Flagged for (or resolved through) manual review.
    Manual,
}

/// Two versions of the same record changed independently since the
/// last sync.
///
/// Conflicts resolved automatically carry a `resolved_version`;
/// conflicts pending manual review carry `resolved_by: Manual` and no
/// resolved version until an operator acts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Unique conflict id.
    pub id: Uuid,
    /// Table the record belongs to.
    pub table: SyncTable,
    /// The record's id.
    pub record_id: String,
    /// The version currently in the target store.
    pub local: RecordPayload,
    /// The incoming version from the source store.
    pub remote: RecordPayload,
    /// Fields both sides changed to different values.
    pub disputed_fields: Vec<String>,
    /// Strategy that resolved, or must resolve, this conflict.
    pub strategy: ResolutionStrategy,
    /// The version that won, once resolved.
    pub resolved_version: Option<RecordPayload>,
    /// Whether resolution was automatic or needs a human.
    pub resolved_by: ResolvedBy,
    /// When the conflict was detected.
    pub detected_at: DateTime<Utc>,
    /// Pattern-store key for this conflict shape, if recorded.
    pub pattern_key: Option<String>,
}

impl Conflict {
    /// Creates an unresolved conflict pending manual review.
    pub fn manual(
        table: SyncTable,
        record_id: impl Into<String>,
        local: RecordPayload,
        remote: RecordPayload,
        disputed_fields: Vec<String>,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            table,
            record_id: record_id.into(),
            local,
            remote,
            disputed_fields,
            strategy: ResolutionStrategy::Manual,
            resolved_version: None,
            resolved_by: ResolvedBy::Manual,
            detected_at,
            pattern_key: None,
        }
    }

    /// Creates a conflict that was resolved automatically.
    pub fn auto_resolved(
        table: SyncTable,
        record_id: impl Into<String>,
        local: RecordPayload,
        remote: RecordPayload,
        disputed_fields: Vec<String>,
        strategy: ResolutionStrategy,
        resolved_version: RecordPayload,
        detected_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            table,
            record_id: record_id.into(),
            local,
            remote,
            disputed_fields,
            strategy,
            resolved_version: Some(resolved_version),
            resolved_by: ResolvedBy::Auto,
            detected_at,
            pattern_key: None,
        }
    }

    /// Returns the record key of the conflicting record.
    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.table, self.record_id.clone())
    }

    /// Returns true if the conflict still needs a human decision.
    pub fn needs_manual_resolution(&self) -> bool {
        self.resolved_by == ResolvedBy::Manual && self.resolved_version.is_none()
    }

    /// Returns true if any disputed field is a clinical-safety or
    /// monetary field of this table.
    pub fn touches_safety_fields(&self) -> bool {
        let safety = self.table.safety_fields();
        self.disputed_fields.iter().any(|f| safety.contains(&f.as_str()))
    }
}

/// Aggregate conflict counts for the status API.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictSummary {
    /// Conflicts resolved automatically since startup.
    pub auto_resolved: u64,
    /// Conflicts merged field-wise (no real conflict).
    pub merged: u64,
    /// Conflicts currently awaiting manual review.
    pub pending_manual: u64,
}
