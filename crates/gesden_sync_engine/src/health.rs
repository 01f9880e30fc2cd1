//! Health monitoring and operator alerts.

use chrono::{DateTime, Duration, Utc};
use gesden_sync_protocol::{
    Alert, AlertKind, AlertQuery, AlertSeverity, AlertStatus, ComponentHealth, ComponentId,
    ConnectionState, HealthLevel, HealthSnapshot,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use tracing::{error, warn};
use uuid::Uuid;

/// Exponential smoothing factor for latency.
const LATENCY_ALPHA: f64 = 0.2;
/// Consecutive failures after which a component turns critical.
const CRITICAL_FAILURE_STREAK: u32 = 3;

#[derive(Debug, Clone)]
struct ComponentState {
    connection: ConnectionState,
    latency_ms: Option<f64>,
    error_count: u64,
    consecutive_failures: u32,
    last_success: Option<DateTime<Utc>>,
}

impl Default for ComponentState {
    fn default() -> Self {
        Self {
            connection: ConnectionState::Disconnected,
            latency_ms: None,
            error_count: 0,
            consecutive_failures: 0,
            last_success: None,
        }
    }
}

/// Tracks per-component health and derives the overall level.
pub struct HealthMonitor {
    components: RwLock<BTreeMap<ComponentId, ComponentState>>,
}

impl Default for HealthMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthMonitor {
    /// Creates a monitor with every component disconnected and healthy.
    pub fn new() -> Self {
        let mut components = BTreeMap::new();
        for id in ComponentId::ALL {
            components.insert(id, ComponentState::default());
        }
        Self {
            components: RwLock::new(components),
        }
    }

    /// Records a successful operation, folding its latency into the
    /// smoothed average and clearing the failure streak.
    pub fn record_success(&self, component: ComponentId, latency: std::time::Duration, now: DateTime<Utc>) {
        let mut components = self.components.write();
        let state = components.entry(component).or_default();
        let sample = latency.as_secs_f64() * 1_000.0;
        state.latency_ms = Some(match state.latency_ms {
            Some(prev) => prev + LATENCY_ALPHA * (sample - prev),
            None => sample,
        });
        state.consecutive_failures = 0;
        state.last_success = Some(now);
    }

    /// Records a failed operation.
    pub fn record_failure(&self, component: ComponentId) {
        let mut components = self.components.write();
        let state = components.entry(component).or_default();
        state.error_count += 1;
        state.consecutive_failures += 1;
        if state.consecutive_failures == CRITICAL_FAILURE_STREAK {
            error!(%component, streak = state.consecutive_failures, "component is failing repeatedly");
        }
    }

    /// Updates the connection state of a component's link.
    pub fn set_connection(&self, component: ComponentId, state: ConnectionState) {
        self.components.write().entry(component).or_default().connection = state;
    }

    /// Returns the connection state of a component's link.
    pub fn connection(&self, component: ComponentId) -> ConnectionState {
        self.components
            .read()
            .get(&component)
            .map(|s| s.connection)
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Number of store links currently connected.
    pub fn active_connections(&self) -> u64 {
        let components = self.components.read();
        [ComponentId::SqlServer, ComponentId::Postgres]
            .iter()
            .filter(|id| {
                components
                    .get(id)
                    .map(|s| s.connection.is_connected())
                    .unwrap_or(false)
            })
            .count() as u64
    }

    /// Builds a point-in-time snapshot with derived levels.
    pub fn snapshot(&self, now: DateTime<Utc>) -> HealthSnapshot {
        let components = self.components.read();
        let mut out = BTreeMap::new();
        for (id, state) in components.iter() {
            out.insert(
                *id,
                ComponentHealth {
                    connection: state.connection,
                    latency_ms: state.latency_ms,
                    error_count: state.error_count,
                    last_success: state.last_success,
                    level: derive_level(state),
                },
            );
        }
        HealthSnapshot::new(out, now)
    }
}

fn derive_level(state: &ComponentState) -> HealthLevel {
    if state.connection == ConnectionState::Error
        || state.consecutive_failures >= CRITICAL_FAILURE_STREAK
    {
        return HealthLevel::Critical;
    }
    match state.connection {
        ConnectionState::Connected => {
            if state.consecutive_failures > 0 {
                HealthLevel::Warning
            } else {
                HealthLevel::Healthy
            }
        }
        _ => HealthLevel::Warning,
    }
}

/// Raised alerts, with duplicate suppression.
///
/// A new alert for a `(component, kind)` pair that already has an
/// active alert of equal-or-lower severity inside the cooldown window
/// only bumps that alert's `updated_at`. A severity escalation always
/// fires a fresh alert, cooldown or not.
pub struct AlertStore {
    alerts: RwLock<Vec<Alert>>,
    cooldown: Duration,
}

impl AlertStore {
    /// Creates a store with the given duplicate-suppression window.
    pub fn new(cooldown: std::time::Duration) -> Self {
        Self {
            alerts: RwLock::new(Vec::new()),
            cooldown: Duration::from_std(cooldown).unwrap_or_else(|_| Duration::seconds(300)),
        }
    }

    /// Raises an alert, applying duplicate suppression.
    ///
    /// Returns the id of the alert that represents this condition
    /// (fresh or refreshed).
    pub fn raise(
        &self,
        component: ComponentId,
        kind: AlertKind,
        severity: AlertSeverity,
        message: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Uuid {
        let message = message.into();
        let mut alerts = self.alerts.write();

        if let Some(existing) = alerts.iter_mut().rev().find(|a| {
            a.component == component && a.kind == kind && a.status == AlertStatus::Active
        }) {
            let within_cooldown = now - existing.updated_at <= self.cooldown;
            if within_cooldown && severity <= existing.severity {
                existing.updated_at = now;
                return existing.id;
            }
        }

        warn!(%component, kind = kind.as_str(), ?severity, %message, "alert raised");
        let alert = Alert::new(component, kind, severity, message, now);
        let id = alert.id;
        alerts.push(alert);
        id
    }

    /// Lists alerts matching the query, newest first.
    pub fn list(&self, query: &AlertQuery) -> Vec<Alert> {
        let alerts = self.alerts.read();
        let mut out: Vec<Alert> = alerts
            .iter()
            .filter(|a| query.status.map_or(true, |s| a.status == s))
            .filter(|a| query.kind.map_or(true, |k| a.kind == k))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Marks an alert acknowledged. Returns the updated alert, or
    /// `None` if the id is unknown.
    pub fn acknowledge(&self, id: Uuid, now: DateTime<Utc>) -> Option<Alert> {
        let mut alerts = self.alerts.write();
        let alert = alerts.iter_mut().find(|a| a.id == id)?;
        alert.acknowledge(now);
        Some(alert.clone())
    }

    /// Marks an alert resolved. Returns the updated alert, or `None`
    /// if the id is unknown.
    pub fn resolve(&self, id: Uuid, now: DateTime<Utc>) -> Option<Alert> {
        let mut alerts = self.alerts.write();
        let alert = alerts.iter_mut().find(|a| a.id == id)?;
        alert.resolve(now);
        Some(alert.clone())
    }

    /// Number of active alerts.
    pub fn active_count(&self) -> usize {
        self.alerts
            .read()
            .iter()
            .filter(|a| a.status == AlertStatus::Active)
            .count()
    }
}
