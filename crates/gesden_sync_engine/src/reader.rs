//! Change feed readers.
//!
//! One reader per store polls its change feed, enqueues new events and
//! advances a durable watermark. A reader that cannot reach its store
//! backs off exponentially and keeps the health monitor informed; it
//! never takes the engine down.

use crate::error::EngineResult;
use crate::health::{AlertStore, HealthMonitor};
use crate::journal::{Journal, JournalRecord};
use crate::queue::OperationQueue;
use crate::store::{ConnectionTracker, StoreClient};
use chrono::Utc;
use gesden_sync_protocol::{
    AlertKind, AlertSeverity, ComponentId, ConnectionState, StoreSide,
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Highest consumed feed sequence per store.
#[derive(Debug, Default)]
pub struct WatermarkStore {
    marks: RwLock<BTreeMap<StoreSide, u64>>,
}

impl WatermarkStore {
    /// Creates a store with both watermarks at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds watermarks from recovered journal state.
    pub fn from_marks(marks: BTreeMap<StoreSide, u64>) -> Self {
        Self {
            marks: RwLock::new(marks),
        }
    }

    /// Returns the watermark for a side (zero if never advanced).
    pub fn get(&self, side: StoreSide) -> u64 {
        self.marks.read().get(&side).copied().unwrap_or(0)
    }

    /// Advances the watermark for a side; never moves it backwards.
    pub fn advance(&self, side: StoreSide, sequence: u64) {
        let mut marks = self.marks.write();
        let mark = marks.entry(side).or_insert(0);
        if sequence > *mark {
            *mark = sequence;
        }
    }

    /// Exports both watermarks for the status API and compaction.
    pub fn export(&self) -> BTreeMap<StoreSide, u64> {
        self.marks.read().clone()
    }
}

/// Poll failures before a feed-stalled alert fires.
const STALL_STREAK: u32 = 3;

/// Polls one store's change feed and feeds the operation queue.
pub struct ChangeFeedReader {
    client: Arc<dyn StoreClient>,
    queue: Arc<OperationQueue>,
    journal: Arc<Journal>,
    watermarks: Arc<WatermarkStore>,
    health: Arc<HealthMonitor>,
    alerts: Arc<AlertStore>,
    tracker: ConnectionTracker,
}

impl ChangeFeedReader {
    /// Creates a reader over one store's feed.
    pub fn new(
        client: Arc<dyn StoreClient>,
        queue: Arc<OperationQueue>,
        journal: Arc<Journal>,
        watermarks: Arc<WatermarkStore>,
        health: Arc<HealthMonitor>,
        alerts: Arc<AlertStore>,
    ) -> Self {
        let tracker = ConnectionTracker::new(client.side());
        Self {
            client,
            queue,
            journal,
            watermarks,
            health,
            alerts,
            tracker,
        }
    }

    fn component(&self) -> ComponentId {
        match self.client.side() {
            StoreSide::SqlServer => ComponentId::SqlServer,
            StoreSide::Postgres => ComponentId::Postgres,
        }
    }

    fn set_connection(&self, state: ConnectionState) {
        self.tracker.transition(state);
        self.health.set_connection(self.component(), state);
    }

    /// Polls the feed once, enqueueing every new event and advancing
    /// the durable watermark past everything enqueued.
    ///
    /// Returns the number of operations enqueued.
    ///
    /// # Errors
    ///
    /// Store errors propagate after the health monitor has recorded
    /// the failure; journal errors are fatal and propagate untouched.
    pub fn poll_once(&self) -> EngineResult<usize> {
        let side = self.client.side();
        let watermark = self.watermarks.get(side);
        let started = Instant::now();

        let events = match self.client.poll_changes(watermark) {
            Ok(events) => events,
            Err(e) => {
                self.health.record_failure(self.component());
                self.set_connection(ConnectionState::Reconnecting);
                return Err(e.into());
            }
        };
        self.health
            .record_success(self.component(), started.elapsed(), Utc::now());
        self.set_connection(ConnectionState::Connected);

        let mut enqueued = 0;
        let mut highest = watermark;
        for event in events {
            highest = highest.max(event.sequence);
            if self.queue.enqueue(event)?.is_some() {
                enqueued += 1;
            }
        }

        if highest > watermark {
            // The watermark is only persisted after the events it
            // covers are journaled, so a crash replays rather than
            // skips.
            self.journal.append(&JournalRecord::Watermark {
                source: side,
                sequence: highest,
            })?;
            self.watermarks.advance(side, highest);
            debug!(store = %side, watermark = highest, enqueued, "feed advanced");
        }

        Ok(enqueued)
    }

    /// Runs the poll loop until `shutdown` is set.
    ///
    /// Consecutive failures back off per the reader's retry config and
    /// raise a feed-stalled alert once the streak passes the stall
    /// threshold.
    pub fn run(
        &self,
        shutdown: &AtomicBool,
        poll_interval: std::time::Duration,
        backoff: &crate::config::RetryConfig,
    ) {
        let side = self.client.side();
        self.set_connection(ConnectionState::Connecting);
        let mut streak: u32 = 0;

        while !shutdown.load(Ordering::Relaxed) {
            match self.poll_once() {
                Ok(_) => {
                    streak = 0;
                    sleep_interruptible(shutdown, poll_interval);
                }
                Err(e) => {
                    streak = streak.saturating_add(1);
                    warn!(store = %side, streak, error = %e, "change feed poll failed");
                    self.alerts.raise(
                        self.component(),
                        AlertKind::StoreUnreachable,
                        AlertSeverity::Warning,
                        format!("change feed poll against {side} failed: {e}"),
                        Utc::now(),
                    );
                    if streak == STALL_STREAK {
                        self.alerts.raise(
                            ComponentId::ChangeFeed,
                            AlertKind::FeedStalled,
                            AlertSeverity::Critical,
                            format!("{side} feed has not advanced for {streak} polls"),
                            Utc::now(),
                        );
                    }
                    sleep_interruptible(shutdown, backoff.delay_for_attempt(streak));
                }
            }
        }
        self.set_connection(ConnectionState::Disconnected);
    }
}

/// Sleeps in small slices so shutdown is observed promptly.
fn sleep_interruptible(shutdown: &AtomicBool, total: std::time::Duration) {
    let slice = std::time::Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        std::thread::sleep(slice.min(deadline.saturating_duration_since(Instant::now())));
    }
}
