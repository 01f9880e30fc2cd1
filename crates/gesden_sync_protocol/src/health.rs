//! Health, stats and alert types surfaced by the status API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::ProtocolError;

/// Components the health monitor tracks.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum ComponentId {
    /// The GESDEN SQL Server store.
    SqlServer,
    /// The Postgres store.
    Postgres,
    /// The sync engine itself (queue + workers).
    SyncEngine,
    /// The change feed transport (both readers).
    ChangeFeed,
}

impl ComponentId {
    /// All tracked components.
    pub const ALL: [ComponentId; 4] = [
        ComponentId::SqlServer,
        ComponentId::Postgres,
        ComponentId::SyncEngine,
        ComponentId::ChangeFeed,
    ];
}

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComponentId::SqlServer => write!(f, "sql_server"),
            ComponentId::Postgres => write!(f, "postgres"),
            ComponentId::SyncEngine => write!(f, "sync_engine"),
            ComponentId::ChangeFeed => write!(f, "change_feed"),
        }
    }
}

/// Connection state of a store link.
///
/// Transitions: Disconnected → Connecting → Connected → Reconnecting,
/// with Error reachable from any state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection attempt in progress.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Link is up.
    Connected,
    /// Link was lost, reconnection in progress.
    Reconnecting,
    /// Link is down with a non-transient error.
    Error,
}

impl ConnectionState {
    /// Returns true if the link is usable.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

/// Health classification, ordered from best to worst.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum HealthLevel {
    /// Operating normally.
    #[default]
    Healthy,
    /// Degraded but functioning.
    Warning,
    /// Not functioning.
    Critical,
}

/// Health of a single component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentHealth {
    /// Connection state of the component's link.
    pub connection: ConnectionState,
    /// Smoothed operation latency in milliseconds, if observed.
    pub latency_ms: Option<f64>,
    /// Errors recorded since startup.
    pub error_count: u64,
    /// Last successful operation.
    pub last_success: Option<DateTime<Utc>>,
    /// Derived health level.
    pub level: HealthLevel,
}

impl Default for ComponentHealth {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            latency_ms: None,
            error_count: 0,
            last_success: None,
            level: HealthLevel::Healthy,
        }
    }
}

/// A point-in-time view of system health.
///
/// Invariant: `overall` is the worst level among `components`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSnapshot {
    /// Per-component health.
    pub components: BTreeMap<ComponentId, ComponentHealth>,
    /// Worst component level.
    pub overall: HealthLevel,
    /// When the snapshot was taken.
    pub generated_at: DateTime<Utc>,
}

impl HealthSnapshot {
    /// Builds a snapshot, deriving `overall` as the worst component level.
    pub fn new(components: BTreeMap<ComponentId, ComponentHealth>, generated_at: DateTime<Utc>) -> Self {
        let overall = components
            .values()
            .map(|c| c.level)
            .max()
            .unwrap_or_default();
        Self {
            components,
            overall,
            generated_at,
        }
    }
}

/// Process-wide rolling counters, reset on restart.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Operations dequeued for processing.
    pub total_operations: u64,
    /// Operations applied to a target store.
    pub successful: u64,
    /// Operations that ended in `Failed`.
    pub failed: u64,
    /// Conflicts detected (auto-resolved and manual).
    pub conflicts: u64,
    /// Operations resolved by disjoint field merge.
    pub merged: u64,
    /// Store links currently connected.
    pub active_connections: u64,
}

/// Alert severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum AlertSeverity {
    /// Informational.
    Info,
    /// Needs attention soon.
    Warning,
    /// Needs attention now.
    Critical,
}

/// What an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// A store could not be reached.
    StoreUnreachable,
    /// An operation exhausted its retries or hit a fatal data error.
    OperationFailed,
    /// A conflict requires manual resolution.
    ConflictManualReview,
    /// A change feed has not advanced within its expected interval.
    FeedStalled,
    /// The durable journal reported an error.
    JournalError,
}

impl AlertKind {
    /// Returns the kind as its wire string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::StoreUnreachable => "store_unreachable",
            AlertKind::OperationFailed => "operation_failed",
            AlertKind::ConflictManualReview => "conflict_manual_review",
            AlertKind::FeedStalled => "feed_stalled",
            AlertKind::JournalError => "journal_error",
        }
    }
}

impl FromStr for AlertKind {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "store_unreachable" => Ok(AlertKind::StoreUnreachable),
            "operation_failed" => Ok(AlertKind::OperationFailed),
            "conflict_manual_review" => Ok(AlertKind::ConflictManualReview),
            "feed_stalled" => Ok(AlertKind::FeedStalled),
            "journal_error" => Ok(AlertKind::JournalError),
            other => Err(ProtocolError::InvalidMessage(format!(
                "unknown alert kind: {other}"
            ))),
        }
    }
}

/// Alert lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertStatus {
    /// Raised and not yet handled.
    Active,
    /// Seen by an operator, not yet fixed.
    Acknowledged,
    /// Handled.
    Resolved,
}

impl FromStr for AlertStatus {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AlertStatus::Active),
            "acknowledged" => Ok(AlertStatus::Acknowledged),
            "resolved" => Ok(AlertStatus::Resolved),
            other => Err(ProtocolError::InvalidMessage(format!(
                "unknown alert status: {other}"
            ))),
        }
    }
}

/// An operator-facing alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Unique alert id.
    pub id: Uuid,
    /// Component the alert concerns.
    pub component: ComponentId,
    /// What the alert is about.
    pub kind: AlertKind,
    /// Severity at the time of (re-)firing.
    pub severity: AlertSeverity,
    /// Human-readable description.
    pub message: String,
    /// Lifecycle state.
    pub status: AlertStatus,
    /// When the alert was first raised.
    pub created_at: DateTime<Utc>,
    /// Last lifecycle or severity change.
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    /// Raises a new active alert.
    pub fn new(
        component: ComponentId,
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            component,
            kind,
            severity,
            message: message.into(),
            status: AlertStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Marks the alert acknowledged.
    pub fn acknowledge(&mut self, now: DateTime<Utc>) {
        self.status = AlertStatus::Acknowledged;
        self.updated_at = now;
    }

    /// Marks the alert resolved.
    pub fn resolve(&mut self, now: DateTime<Utc>) {
        self.status = AlertStatus::Resolved;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.timestamp_opt(1_000, 0).unwrap()
    }

    #[test]
    fn overall_is_worst_component() {
        let mut components = BTreeMap::new();
        components.insert(ComponentId::SqlServer, ComponentHealth::default());
        components.insert(
            ComponentId::Postgres,
            ComponentHealth {
                level: HealthLevel::Warning,
                ..ComponentHealth::default()
            },
        );
        components.insert(
            ComponentId::SyncEngine,
            ComponentHealth {
                level: HealthLevel::Critical,
                ..ComponentHealth::default()
            },
        );

        let snapshot = HealthSnapshot::new(components, now());
        assert_eq!(snapshot.overall, HealthLevel::Critical);
    }

    #[test]
    fn empty_snapshot_is_healthy() {
        let snapshot = HealthSnapshot::new(BTreeMap::new(), now());
        assert_eq!(snapshot.overall, HealthLevel::Healthy);
    }

    #[test]
    fn health_level_ordering() {
        assert!(HealthLevel::Critical > HealthLevel::Warning);
        assert!(HealthLevel::Warning > HealthLevel::Healthy);
    }

    #[test]
    fn alert_lifecycle() {
        let mut alert = Alert::new(
            ComponentId::Postgres,
            AlertKind::StoreUnreachable,
            AlertSeverity::Critical,
            "connection refused",
            now(),
        );
        assert_eq!(alert.status, AlertStatus::Active);

        alert.acknowledge(now());
        assert_eq!(alert.status, AlertStatus::Acknowledged);

        alert.resolve(now());
        assert_eq!(alert.status, AlertStatus::Resolved);
    }

    #[test]
    fn alert_kind_string_roundtrip() {
        for kind in [
            AlertKind::StoreUnreachable,
            AlertKind::OperationFailed,
            AlertKind::ConflictManualReview,
            AlertKind::FeedStalled,
            AlertKind::JournalError,
        ] {
            assert_eq!(kind.as_str().parse::<AlertKind>().unwrap(), kind);
        }
        assert!("disk_full".parse::<AlertKind>().is_err());
    }
}
