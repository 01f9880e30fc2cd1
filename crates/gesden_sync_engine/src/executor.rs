//! Operation executor.
//!
//! Takes one dequeued operation at a time, applies it to the target
//! store and settles the outcome: applied, merged, auto-resolved,
//! flagged for manual review, or failed after retries. Resolved and
//! merged versions are written to both stores so they converge; the
//! base ledger then recognizes the echoing feed events as duplicates.

use crate::config::RetryConfig;
use crate::error::{EngineError, EngineResult};
use crate::health::{AlertStore, HealthMonitor};
use crate::journal::{Journal, JournalRecord};
use crate::ledger::BaseLedger;
use crate::resolver::{ConflictLog, ConflictResolver, Resolution};
use crate::stats::SyncStats;
use crate::store::StoreClient;
use chrono::Utc;
use gesden_sync_protocol::{
    AlertKind, AlertSeverity, ChangeKind, ComponentId, OperationStatus, RecordPayload, StoreSide,
    SyncOperation,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

fn component_for(side: StoreSide) -> ComponentId {
    match side {
        StoreSide::SqlServer => ComponentId::SqlServer,
        StoreSide::Postgres => ComponentId::Postgres,
    }
}

enum ApplyOutcome {
    /// Written to the target store as-is.
    Applied,
    /// Already at or past this version; nothing written.
    Skipped,
    /// Disjoint changes merged and written to both stores.
    Merged,
    /// Disputed fields auto-resolved and written to both stores.
    AutoResolved,
}

/// Applies sync operations against the two stores.
pub struct SyncExecutor {
    sql_server: Arc<dyn StoreClient>,
    postgres: Arc<dyn StoreClient>,
    resolver: Arc<ConflictResolver>,
    conflicts: Arc<ConflictLog>,
    ledger: Arc<BaseLedger>,
    journal: Arc<Journal>,
    stats: Arc<SyncStats>,
    health: Arc<HealthMonitor>,
    alerts: Arc<AlertStore>,
    retry: RetryConfig,
}

impl SyncExecutor {
    /// Creates an executor over the two store clients.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sql_server: Arc<dyn StoreClient>,
        postgres: Arc<dyn StoreClient>,
        resolver: Arc<ConflictResolver>,
        conflicts: Arc<ConflictLog>,
        ledger: Arc<BaseLedger>,
        journal: Arc<Journal>,
        stats: Arc<SyncStats>,
        health: Arc<HealthMonitor>,
        alerts: Arc<AlertStore>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            sql_server,
            postgres,
            resolver,
            conflicts,
            ledger,
            journal,
            stats,
            health,
            alerts,
            retry,
        }
    }

    fn client(&self, side: StoreSide) -> &dyn StoreClient {
        match side {
            StoreSide::SqlServer => self.sql_server.as_ref(),
            StoreSide::Postgres => self.postgres.as_ref(),
        }
    }

    /// Processes one operation to a terminal status.
    ///
    /// Transient store errors are retried with backoff up to the
    /// configured attempt limit; everything else settles immediately.
    /// Returns `(status, attempts, last_error)` for the queue.
    pub fn process(&self, op: &SyncOperation) -> (OperationStatus, u32, Option<String>) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let started = Instant::now();
            match self.apply_once(op) {
                Ok(outcome) => {
                    self.health.record_success(
                        component_for(op.event.target()),
                        started.elapsed(),
                        Utc::now(),
                    );
                    self.stats.record_applied();
                    match outcome {
                        ApplyOutcome::Merged => self.stats.record_merged(),
                        ApplyOutcome::AutoResolved => self.stats.record_conflict(),
                        ApplyOutcome::Applied | ApplyOutcome::Skipped => {}
                    }
                    debug!(op_id = op.op_id, attempts, "operation applied");
                    return (OperationStatus::Applied, attempts, None);
                }
                Err(EngineError::ConflictUnresolved { key }) => {
                    // Recorded in the conflict log by apply_once; the
                    // operation parks until an operator decides.
                    self.stats.record_conflict();
                    self.alerts.raise(
                        ComponentId::SyncEngine,
                        AlertKind::ConflictManualReview,
                        AlertSeverity::Warning,
                        format!("conflict on {key} needs manual review"),
                        Utc::now(),
                    );
                    return (OperationStatus::Conflicted, attempts, None);
                }
                Err(e) if e.is_retryable() && attempts < self.retry.max_attempts => {
                    self.health.record_failure(component_for(op.event.target()));
                    warn!(op_id = op.op_id, attempts, error = %e, "apply failed, retrying");
                    std::thread::sleep(self.retry.delay_for_attempt(attempts));
                }
                Err(e) => {
                    self.health.record_failure(component_for(op.event.target()));
                    self.stats.record_failed();
                    let kind = match &e {
                        EngineError::JournalIo(_) | EngineError::JournalCorrupt { .. } => {
                            AlertKind::JournalError
                        }
                        _ => AlertKind::OperationFailed,
                    };
                    self.alerts.raise(
                        ComponentId::SyncEngine,
                        kind,
                        AlertSeverity::Critical,
                        format!("operation {} on {} failed: {e}", op.op_id, op.key()),
                        Utc::now(),
                    );
                    warn!(op_id = op.op_id, attempts, error = %e, "operation failed terminally");
                    return (OperationStatus::Failed, attempts, Some(e.to_string()));
                }
            }
        }
    }

    fn apply_once(&self, op: &SyncOperation) -> EngineResult<ApplyOutcome> {
        let key = op.key();
        let target_side = op.event.target();
        let target = self.client(target_side);

        // A version at or past this one was already applied; the event
        // is an echo or a redelivery.
        if let Some(applied_ts) = self.ledger.last_applied_ts(&key) {
            if applied_ts >= op.event.source_ts {
                debug!(op_id = op.op_id, key = %key, "skipping already-applied version");
                return Ok(ApplyOutcome::Skipped);
            }
        }

        if op.event.kind == ChangeKind::Delete {
            target.apply_delete(&key)?;
            self.record_base(&key, None, op)?;
            return Ok(ApplyOutcome::Applied);
        }

        let payload = op
            .event
            .payload
            .as_ref()
            .ok_or_else(|| EngineError::MissingPayload { key: key.clone() })?;

        let current = target.fetch(&key)?;
        let Some(current) = current else {
            target.apply_upsert(payload)?;
            self.record_base(&key, Some(payload.clone()), op)?;
            return Ok(ApplyOutcome::Applied);
        };

        let base_entry = self.ledger.get(&key);
        let base = base_entry.as_ref().and_then(|e| e.payload.as_ref());

        match self
            .resolver
            .resolve(base, &current, payload, op.event.source, Utc::now())?
        {
            Resolution::Unchanged => {
                self.record_base(&key, Some(payload.clone()), op)?;
                Ok(ApplyOutcome::Skipped)
            }
            Resolution::Merged(merged) => {
                self.write_both(&merged)?;
                self.record_base(&key, Some(merged), op)?;
                self.conflicts.record_merged();
                Ok(ApplyOutcome::Merged)
            }
            Resolution::AutoResolved { resolved, conflict } => {
                self.write_both(&resolved)?;
                self.record_base(&key, Some(resolved), op)?;
                self.conflicts.record_auto(conflict);
                Ok(ApplyOutcome::AutoResolved)
            }
            Resolution::NeedsManual { conflict } => {
                self.conflicts.record_manual(conflict)?;
                Err(EngineError::ConflictUnresolved { key })
            }
        }
    }

    /// Writes a resolved or merged version to both stores so they
    /// converge on it.
    fn write_both(&self, payload: &RecordPayload) -> EngineResult<()> {
        self.sql_server.apply_upsert(payload)?;
        self.postgres.apply_upsert(payload)?;
        Ok(())
    }

    fn record_base(
        &self,
        key: &gesden_sync_protocol::RecordKey,
        payload: Option<RecordPayload>,
        op: &SyncOperation,
    ) -> EngineResult<()> {
        // The applied timestamp covers the later of the event and the
        // written version, so the counterpart feed echo is skipped.
        let applied_ts = payload
            .as_ref()
            .map(|p| p.updated_at().max(op.event.source_ts))
            .unwrap_or(op.event.source_ts);
        self.journal.append(&JournalRecord::Base {
            key: key.clone(),
            payload: payload.clone(),
            applied_ts,
        })?;
        self.ledger.record_applied(key.clone(), payload, applied_ts);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::StoreError;
    use crate::store::MemoryStore;
    use chrono::{DateTime, TimeZone};
    use gesden_sync_protocol::{ChangeEvent, PatientRecord, RecordKey, SyncTable};
    use std::time::Duration;
    use tempfile::tempdir;

    fn ts(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn patient(id: &str, telefono: Option<&str>, direccion: Option<&str>, secs: i64) -> RecordPayload {
        let mut p = PatientRecord::new(id, "Ana", "García", ts(secs));
        p.telefono = telefono.map(String::from);
        p.direccion = direccion.map(String::from);
        RecordPayload::Pacientes(p)
    }

    struct Fixture {
        sql_server: Arc<MemoryStore>,
        postgres: Arc<MemoryStore>,
        executor: SyncExecutor,
        ledger: Arc<BaseLedger>,
        conflicts: Arc<ConflictLog>,
        alerts: Arc<AlertStore>,
        stats: Arc<SyncStats>,
        _dir: tempfile::TempDir,
    }

    fn fixture(retry: RetryConfig) -> Fixture {
        let dir = tempdir().unwrap();
        let (journal, _) = Journal::open(dir.path().join("journal.jsonl")).unwrap();
        let journal = Arc::new(journal);
        let sql_server = Arc::new(MemoryStore::new(StoreSide::SqlServer));
        let postgres = Arc::new(MemoryStore::new(StoreSide::Postgres));
        let ledger = Arc::new(BaseLedger::new());
        let conflicts = Arc::new(ConflictLog::new(journal.clone()));
        let alerts = Arc::new(AlertStore::new(Duration::from_secs(300)));
        let stats = Arc::new(SyncStats::new());
        let executor = SyncExecutor::new(
            sql_server.clone(),
            postgres.clone(),
            Arc::new(ConflictResolver::new(&EngineConfig::new("journal.jsonl"))),
            conflicts.clone(),
            ledger.clone(),
            journal,
            stats.clone(),
            Arc::new(HealthMonitor::new()),
            alerts.clone(),
            retry,
        );
        Fixture {
            sql_server,
            postgres,
            executor,
            ledger,
            conflicts,
            alerts,
            stats,
            _dir: dir,
        }
    }

    fn op_from(event: ChangeEvent, op_id: u64) -> SyncOperation {
        SyncOperation::new(op_id, event)
    }

    #[test]
    fn upsert_flows_to_the_other_store() {
        let f = fixture(RetryConfig::no_retry());
        let payload = patient("p-1", Some("600111222"), None, 10);
        let op = op_from(
            ChangeEvent::upsert(StoreSide::SqlServer, payload.clone(), ts(10), 1),
            1,
        );

        let (status, attempts, err) = f.executor.process(&op);
        assert_eq!(status, OperationStatus::Applied);
        assert_eq!(attempts, 1);
        assert!(err.is_none());

        let key = RecordKey::new(SyncTable::Pacientes, "p-1");
        assert_eq!(f.postgres.get(&key), Some(payload));
        assert_eq!(f.ledger.last_applied_ts(&key), Some(ts(10)));
        assert_eq!(f.stats.snapshot().successful, 1);
    }

    #[test]
    fn echo_of_applied_version_is_skipped() {
        let f = fixture(RetryConfig::no_retry());
        let payload = patient("p-1", Some("600111222"), None, 10);
        let op = op_from(
            ChangeEvent::upsert(StoreSide::SqlServer, payload.clone(), ts(10), 1),
            1,
        );
        f.executor.process(&op);

        // The write into Postgres echoes back on its feed.
        let echo = op_from(
            ChangeEvent::upsert(StoreSide::Postgres, payload, ts(10), 1),
            2,
        );
        let (status, _, _) = f.executor.process(&echo);
        assert_eq!(status, OperationStatus::Applied);
        // Target store was never touched by the echo.
        assert!(f
            .sql_server
            .get(&RecordKey::new(SyncTable::Pacientes, "p-1"))
            .is_none());
    }

    #[test]
    fn delete_propagates() {
        let f = fixture(RetryConfig::no_retry());
        let key = RecordKey::new(SyncTable::Pacientes, "p-1");
        f.postgres.seed(patient("p-1", None, None, 10));

        let op = op_from(
            ChangeEvent::delete(StoreSide::SqlServer, SyncTable::Pacientes, "p-1", ts(20), 1),
            1,
        );
        let (status, _, _) = f.executor.process(&op);

        assert_eq!(status, OperationStatus::Applied);
        assert!(f.postgres.get(&key).is_none());
        assert_eq!(f.ledger.last_applied_ts(&key), Some(ts(20)));
    }

    #[test]
    fn disjoint_edits_merge_into_both_stores() {
        let f = fixture(RetryConfig::no_retry());
        let key = RecordKey::new(SyncTable::Pacientes, "p-1");
        let base = patient("p-1", Some("600111222"), Some("Calle Mayor 1"), 0);
        f.ledger.record_applied(key.clone(), Some(base.clone()), ts(0));
        f.sql_server.seed(base.clone());
        f.postgres
            .seed(patient("p-1", Some("600111222"), Some("Avenida Sol 5"), 30));

        // SQL Server changed the phone; Postgres had changed the address.
        let incoming = patient("p-1", Some("600999888"), Some("Calle Mayor 1"), 20);
        let op = op_from(
            ChangeEvent::upsert(StoreSide::SqlServer, incoming, ts(20), 1),
            1,
        );
        let (status, _, _) = f.executor.process(&op);
        assert_eq!(status, OperationStatus::Applied);

        for store in [&f.sql_server, &f.postgres] {
            match store.get(&key).unwrap() {
                RecordPayload::Pacientes(p) => {
                    assert_eq!(p.telefono.as_deref(), Some("600999888"));
                    assert_eq!(p.direccion.as_deref(), Some("Avenida Sol 5"));
                }
                other => panic!("unexpected payload {other:?}"),
            }
        }
        assert_eq!(f.stats.snapshot().merged, 1);
        assert_eq!(f.conflicts.summary().merged, 1);
    }

    #[test]
    fn safety_field_conflict_parks_for_manual_review() {
        let f = fixture(RetryConfig::no_retry());
        let key = RecordKey::new(SyncTable::Pacientes, "p-1");
        let mut base = PatientRecord::new("p-1", "Ana", "García", ts(0));
        base.alergias = vec!["penicilina".into()];
        let base = RecordPayload::Pacientes(base);
        f.ledger.record_applied(key.clone(), Some(base.clone()), ts(0));

        let mut local = PatientRecord::new("p-1", "Ana", "García", ts(30));
        local.alergias = vec!["penicilina".into(), "ibuprofeno".into()];
        f.postgres.seed(RecordPayload::Pacientes(local.clone()));

        let remote = RecordPayload::Pacientes(PatientRecord::new("p-1", "Ana", "García", ts(20)));
        let op = op_from(ChangeEvent::upsert(StoreSide::SqlServer, remote, ts(20), 1), 1);

        let (status, _, _) = f.executor.process(&op);
        assert_eq!(status, OperationStatus::Conflicted);

        // Neither store was written.
        assert_eq!(
            f.postgres.get(&key),
            Some(RecordPayload::Pacientes(local))
        );
        let pending = f.conflicts.pending();
        assert_eq!(pending.len(), 1);
        assert!(pending[0].touches_safety_fields());
        assert_eq!(f.alerts.active_count(), 1);
        assert_eq!(f.stats.snapshot().conflicts, 1);
    }

    #[test]
    fn fatal_store_error_fails_without_retry() {
        let f = fixture(RetryConfig::new(5).without_jitter());
        f.postgres
            .set_fail_mode(Some(StoreError::Fatal("unique constraint".into())));

        let op = op_from(
            ChangeEvent::upsert(
                StoreSide::SqlServer,
                patient("p-1", None, None, 10),
                ts(10),
                1,
            ),
            1,
        );
        let (status, attempts, err) = f.executor.process(&op);

        assert_eq!(status, OperationStatus::Failed);
        assert_eq!(attempts, 1);
        assert!(err.unwrap().contains("unique constraint"));
        assert_eq!(f.stats.snapshot().failed, 1);
        assert_eq!(f.alerts.active_count(), 1);
    }

    #[test]
    fn transient_error_exhausts_retries() {
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .without_jitter();
        let f = fixture(retry);
        f.postgres
            .set_fail_mode(Some(StoreError::Transient("connection reset".into())));

        let op = op_from(
            ChangeEvent::upsert(
                StoreSide::SqlServer,
                patient("p-1", None, None, 10),
                ts(10),
                1,
            ),
            1,
        );
        let (status, attempts, _) = f.executor.process(&op);

        assert_eq!(status, OperationStatus::Failed);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn missing_payload_is_fatal() {
        let f = fixture(RetryConfig::new(5));
        let mut event = ChangeEvent::upsert(
            StoreSide::SqlServer,
            patient("p-1", None, None, 10),
            ts(10),
            1,
        );
        event.payload = None;

        let (status, attempts, err) = f.executor.process(&op_from(event, 1));
        assert_eq!(status, OperationStatus::Failed);
        assert_eq!(attempts, 1);
        assert!(err.unwrap().contains("no payload"));
    }
}
