//! The sync engine: lifecycle, worker threads and the operator seam.

use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::executor::SyncExecutor;
use crate::health::{AlertStore, HealthMonitor};
use crate::journal::Journal;
use crate::ledger::BaseLedger;
use crate::queue::OperationQueue;
use crate::reader::{ChangeFeedReader, WatermarkStore};
use crate::resolver::{ConflictLog, ConflictResolver};
use crate::stats::SyncStats;
use crate::store::StoreClient;
use chrono::Utc;
use gesden_sync_protocol::{
    Alert, AlertKind, AlertQuery, AlertSeverity, ChangeEvent, ComponentId, ConnectionState,
    ForceSyncReport, ForceSyncRequest, RecordKey, RecordPayload, StatusResponse, StoreSide,
    SyncTable, WatermarkInfo,
};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, recovery done, threads not started.
    Idle,
    /// Readers and workers running.
    Running,
    /// Shutdown requested, threads draining.
    Stopping,
    /// Threads joined.
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineState::Idle => write!(f, "idle"),
            EngineState::Running => write!(f, "running"),
            EngineState::Stopping => write!(f, "stopping"),
            EngineState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Operator-facing control surface of the engine.
///
/// The status server depends on this trait rather than the concrete
/// engine, so it can be tested against a stub.
pub trait EngineControl: Send + Sync {
    /// Current engine, health, conflict and queue state.
    fn status(&self) -> StatusResponse;

    /// Runs a full reconciliation pass over one or all tables.
    fn force_sync(&self, request: &ForceSyncRequest) -> EngineResult<ForceSyncReport>;

    /// Lists alerts matching the query, newest first.
    fn list_alerts(&self, query: &AlertQuery) -> Vec<Alert>;

    /// Acknowledges an alert; `None` if the id is unknown.
    fn acknowledge_alert(&self, id: Uuid) -> Option<Alert>;

    /// Resolves an alert; `None` if the id is unknown.
    fn resolve_alert(&self, id: Uuid) -> Option<Alert>;
}

/// The bidirectional sync engine.
///
/// Owns the durable journal, the operation queue, one change feed
/// reader per store and a pool of apply workers. Constructing the
/// engine performs crash recovery; [`SyncEngine::start`] begins
/// processing.
pub struct SyncEngine {
    config: EngineConfig,
    journal: Arc<Journal>,
    queue: Arc<OperationQueue>,
    ledger: Arc<BaseLedger>,
    watermarks: Arc<WatermarkStore>,
    conflicts: Arc<ConflictLog>,
    stats: Arc<SyncStats>,
    health: Arc<HealthMonitor>,
    alerts: Arc<AlertStore>,
    executor: Arc<SyncExecutor>,
    sql_reader: Arc<ChangeFeedReader>,
    postgres_reader: Arc<ChangeFeedReader>,
    sql_server: Arc<dyn StoreClient>,
    postgres: Arc<dyn StoreClient>,
    shutdown: Arc<AtomicBool>,
    state: RwLock<EngineState>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Builds an engine over the two store clients, opening the
    /// journal and recovering any interrupted state.
    ///
    /// # Errors
    ///
    /// Fails on invalid configuration, a locked or corrupt journal, or
    /// journal I/O errors.
    pub fn new(
        config: EngineConfig,
        sql_server: Arc<dyn StoreClient>,
        postgres: Arc<dyn StoreClient>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let (journal, recovered) = Journal::open(&config.journal_path)?;
        let journal = Arc::new(journal);
        info!(
            journal = %journal.path().display(),
            recovered_ops = recovered.operations.len(),
            "engine recovering from journal"
        );

        let queue = Arc::new(OperationQueue::new(journal.clone(), &recovered));
        let ledger = Arc::new(BaseLedger::from_entries(recovered.bases));
        let watermarks = Arc::new(WatermarkStore::from_marks(recovered.watermarks));
        let conflicts = Arc::new(ConflictLog::recover(
            journal.clone(),
            recovered.pending_conflicts,
        ));
        let stats = Arc::new(SyncStats::new());
        let health = Arc::new(HealthMonitor::new());
        let alerts = Arc::new(AlertStore::new(config.alert_cooldown));
        let resolver = Arc::new(ConflictResolver::new(&config));

        let executor = Arc::new(SyncExecutor::new(
            sql_server.clone(),
            postgres.clone(),
            resolver,
            conflicts.clone(),
            ledger.clone(),
            journal.clone(),
            stats.clone(),
            health.clone(),
            alerts.clone(),
            config.retry.clone(),
        ));

        let sql_reader = Arc::new(ChangeFeedReader::new(
            sql_server.clone(),
            queue.clone(),
            journal.clone(),
            watermarks.clone(),
            health.clone(),
            alerts.clone(),
        ));
        let postgres_reader = Arc::new(ChangeFeedReader::new(
            postgres.clone(),
            queue.clone(),
            journal.clone(),
            watermarks.clone(),
            health.clone(),
            alerts.clone(),
        ));

        Ok(Self {
            config,
            journal,
            queue,
            ledger,
            watermarks,
            conflicts,
            stats,
            health,
            alerts,
            executor,
            sql_reader,
            postgres_reader,
            sql_server,
            postgres,
            shutdown: Arc::new(AtomicBool::new(false)),
            state: RwLock::new(EngineState::Idle),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        *self.state.read()
    }

    /// Connects both stores and spawns reader and worker threads.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ShuttingDown`] if the engine was already
    /// stopped. A store that fails to connect does not fail startup;
    /// its reader keeps retrying with backoff.
    pub fn start(self: &Arc<Self>) -> EngineResult<()> {
        {
            let mut state = self.state.write();
            match *state {
                EngineState::Idle => *state = EngineState::Running,
                EngineState::Running => return Ok(()),
                EngineState::Stopping | EngineState::Stopped => {
                    return Err(EngineError::ShuttingDown)
                }
            }
        }

        self.connect_store(self.sql_server.as_ref(), ComponentId::SqlServer);
        self.connect_store(self.postgres.as_ref(), ComponentId::Postgres);
        self.health
            .set_connection(ComponentId::SyncEngine, ConnectionState::Connected);
        self.health
            .set_connection(ComponentId::ChangeFeed, ConnectionState::Connected);

        let mut threads = self.threads.lock();

        for reader in [self.sql_reader.clone(), self.postgres_reader.clone()] {
            let shutdown = self.shutdown.clone();
            let poll_interval = self.config.poll_interval;
            let backoff = self.config.reader_backoff.clone();
            threads.push(std::thread::spawn(move || {
                reader.run(&shutdown, poll_interval, &backoff);
            }));
        }

        for worker_id in 0..self.config.worker_count {
            let engine = self.clone();
            threads.push(std::thread::spawn(move || engine.worker_loop(worker_id)));
        }

        info!(workers = self.config.worker_count, "engine started");
        Ok(())
    }

    fn connect_store(&self, client: &dyn StoreClient, component: ComponentId) {
        self.health
            .set_connection(component, ConnectionState::Connecting);
        match client.connect() {
            Ok(()) => {
                self.health
                    .set_connection(component, ConnectionState::Connected);
            }
            Err(e) => {
                warn!(store = %client.side(), error = %e, "store connection failed at startup");
                self.health
                    .set_connection(component, ConnectionState::Reconnecting);
                self.alerts.raise(
                    component,
                    AlertKind::StoreUnreachable,
                    AlertSeverity::Critical,
                    format!("could not connect to {}: {e}", client.side()),
                    Utc::now(),
                );
            }
        }
        self.stats
            .set_active_connections(self.health.active_connections());
    }

    fn worker_loop(&self, worker_id: usize) {
        while !self.shutdown.load(Ordering::Relaxed) {
            match self.step() {
                Ok(true) => {}
                Ok(false) => std::thread::sleep(std::time::Duration::from_millis(20)),
                Err(e) => {
                    error!(worker_id, error = %e, "worker step failed");
                    self.alerts.raise(
                        ComponentId::SyncEngine,
                        AlertKind::JournalError,
                        AlertSeverity::Critical,
                        format!("worker {worker_id} hit a journal error: {e}"),
                        Utc::now(),
                    );
                    std::thread::sleep(std::time::Duration::from_millis(500));
                }
            }
        }
    }

    /// Processes at most one queued operation.
    ///
    /// Returns `true` if an operation was processed. Used by the
    /// worker threads and directly by tests that drive the engine
    /// synchronously.
    pub fn step(&self) -> EngineResult<bool> {
        let Some(op) = self.queue.dequeue_next()? else {
            return Ok(false);
        };
        self.stats.record_dequeued();
        let (status, attempts, last_error) = self.executor.process(&op);
        self.queue.complete(op.op_id, status, attempts, last_error)?;
        self.stats
            .set_active_connections(self.health.active_connections());
        self.compact_if_needed()?;
        Ok(true)
    }

    /// Polls both change feeds once. Returns operations enqueued.
    ///
    /// Test and maintenance entry point; the running engine polls from
    /// its reader threads.
    pub fn poll_feeds_once(&self) -> EngineResult<usize> {
        let mut enqueued = 0;
        for reader in [&self.sql_reader, &self.postgres_reader] {
            match reader.poll_once() {
                Ok(n) => enqueued += n,
                Err(EngineError::Store(e)) => {
                    warn!(error = %e, "feed poll failed");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(enqueued)
    }

    /// Drains the queue synchronously until it is empty.
    ///
    /// Returns the number of operations processed.
    pub fn run_pending(&self) -> EngineResult<usize> {
        let mut processed = 0;
        while self.step()? {
            processed += 1;
        }
        Ok(processed)
    }

    /// Requests shutdown and joins all threads. Idempotent.
    pub fn shutdown(&self) {
        {
            let mut state = self.state.write();
            if matches!(*state, EngineState::Stopped) {
                return;
            }
            *state = EngineState::Stopping;
        }
        info!("engine shutting down");
        self.shutdown.store(true, Ordering::Relaxed);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.threads.lock());
        for handle in handles {
            if handle.join().is_err() {
                error!("engine thread panicked during shutdown");
            }
        }

        self.health
            .set_connection(ComponentId::SyncEngine, ConnectionState::Disconnected);
        *self.state.write() = EngineState::Stopped;
        info!("engine stopped");
    }

    /// Rewrites the journal if the configured record threshold was
    /// passed since the last compaction.
    pub fn compact_if_needed(&self) -> EngineResult<bool> {
        if self.journal.records_since_compact() < self.config.journal_compact_threshold {
            return Ok(false);
        }
        // The queue snapshots its own live operations under its lock
        // so nothing enqueued mid-rewrite lands in the discarded file.
        self.queue.compact(
            self.watermarks.export(),
            self.ledger.export(),
            self.conflicts.pending(),
        )?;
        info!(live_ops = self.queue.live_count(), "journal compacted");
        Ok(true)
    }

    /// Compares one table across both stores and enqueues a
    /// reconciliation operation for every diverged record.
    fn reconcile_table(&self, table: SyncTable, report: &mut ForceSyncReport) -> EngineResult<()> {
        let sql_records = self.sql_server.scan(table)?;
        let pg_records = self.postgres.scan(table)?;

        let mut keys: BTreeSet<RecordKey> = BTreeSet::new();
        let index = |records: &[RecordPayload]| {
            records
                .iter()
                .map(|p| (RecordKey::new(p.table(), p.id()), p.clone()))
                .collect::<std::collections::BTreeMap<_, _>>()
        };
        let sql_by_key = index(&sql_records);
        let pg_by_key = index(&pg_records);
        keys.extend(sql_by_key.keys().cloned());
        keys.extend(pg_by_key.keys().cloned());

        for key in keys {
            report.examined += 1;
            if self.queue.has_key(&key) {
                report.skipped_in_flight += 1;
                continue;
            }

            let sql = sql_by_key.get(&key);
            let pg = pg_by_key.get(&key);
            // The newer side becomes the synthetic event source; the
            // normal pipeline then merges or resolves as usual.
            // Postgres wins an exact timestamp tie.
            let source_payload = match (sql, pg) {
                (Some(s), Some(p)) => {
                    if s.changed_fields(p)?.is_empty() {
                        continue;
                    }
                    if s.updated_at() > p.updated_at() {
                        (StoreSide::SqlServer, s.clone())
                    } else {
                        (StoreSide::Postgres, p.clone())
                    }
                }
                (Some(s), None) => (StoreSide::SqlServer, s.clone()),
                (None, Some(p)) => (StoreSide::Postgres, p.clone()),
                (None, None) => continue,
            };

            let (source, payload) = source_payload;
            let source_ts = payload.updated_at();
            let event = ChangeEvent::upsert(source, payload, source_ts, 0);
            if self.queue.enqueue(event)?.is_some() {
                report.enqueued += 1;
            }
        }
        Ok(())
    }
}

impl EngineControl for SyncEngine {
    fn status(&self) -> StatusResponse {
        self.stats
            .set_active_connections(self.health.active_connections());
        let watermarks = self
            .watermarks
            .export()
            .into_iter()
            .map(|(source, watermark)| WatermarkInfo { source, watermark })
            .collect();
        StatusResponse {
            engine_state: self.state().to_string(),
            stats: self.stats.snapshot(),
            health: self.health.snapshot(Utc::now()),
            conflicts: self.conflicts.summary(),
            pending_operations: self.queue.live_count() as u64,
            watermarks,
        }
    }

    fn force_sync(&self, request: &ForceSyncRequest) -> EngineResult<ForceSyncReport> {
        if matches!(self.state(), EngineState::Stopping | EngineState::Stopped) {
            return Err(EngineError::ShuttingDown);
        }
        let started = Instant::now();
        let mut report = ForceSyncReport::default();
        let tables: Vec<SyncTable> = match request.table {
            Some(table) => vec![table],
            None => SyncTable::ALL.to_vec(),
        };
        for table in tables {
            self.reconcile_table(table, &mut report)?;
        }
        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            examined = report.examined,
            enqueued = report.enqueued,
            skipped = report.skipped_in_flight,
            "force sync pass complete"
        );
        Ok(report)
    }

    fn list_alerts(&self, query: &AlertQuery) -> Vec<Alert> {
        self.alerts.list(query)
    }

    fn acknowledge_alert(&self, id: Uuid) -> Option<Alert> {
        self.alerts.acknowledge(id, Utc::now())
    }

    fn resolve_alert(&self, id: Uuid) -> Option<Alert> {
        self.alerts.resolve(id, Utc::now())
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
