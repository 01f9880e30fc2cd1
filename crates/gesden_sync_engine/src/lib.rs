//! # GESDEN Sync Engine
//!
//! Bidirectional synchronization between the legacy GESDEN SQL Server
//! store and the Postgres store of the clinic application.
//!
//! The engine polls both change feeds, sequences changes through a
//! durable per-record FIFO queue, and applies each one to the opposite
//! store. Concurrent edits to the same record are merged field-wise
//! when the changed sets are disjoint; true disputes resolve by
//! last-writer-wins unless they touch clinical-safety fields, which
//! always park for manual review.
//!
//! Construction performs crash recovery from the JSON-lines journal;
//! [`SyncEngine::start`] spawns the reader and worker threads.
//!
//! ```no_run
//! use gesden_sync_engine::{EngineConfig, MemoryStore, SyncEngine};
//! use gesden_sync_protocol::StoreSide;
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), gesden_sync_engine::EngineError> {
//! let sql_server = Arc::new(MemoryStore::new(StoreSide::SqlServer));
//! let postgres = Arc::new(MemoryStore::new(StoreSide::Postgres));
//! let config = EngineConfig::new("/var/lib/gesden-sync/journal.jsonl");
//! let engine = Arc::new(SyncEngine::new(config, sql_server, postgres)?);
//! engine.start()?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod engine;
mod error;
mod executor;
mod health;
pub mod journal;
mod ledger;
mod queue;
mod reader;
mod resolver;
mod stats;
mod store;

pub use config::{EngineConfig, RetryConfig};
pub use engine::{EngineControl, EngineState, SyncEngine};
pub use error::{EngineError, EngineResult, StoreError};
pub use executor::SyncExecutor;
pub use health::{AlertStore, HealthMonitor};
pub use journal::{BaseEntry, Journal, JournalRecord, JournalState};
pub use ledger::BaseLedger;
pub use queue::OperationQueue;
pub use reader::{ChangeFeedReader, WatermarkStore};
pub use resolver::{ConflictLog, ConflictResolver, PatternEntry, PatternStore, Resolution};
pub use stats::SyncStats;
pub use store::{ConnectionTracker, MemoryStore, StoreClient};
