//! Error types for the sync engine.

use gesden_sync_protocol::{ProtocolError, RecordKey};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reported by a store client.
///
/// The transient/fatal split drives retry behavior: transient errors
/// (network drop, lock timeout) are retried with backoff; fatal errors
/// (constraint violation, schema mismatch) terminate the operation and
/// raise an alert.
#[derive(Error, Debug, Clone)]
pub enum StoreError {
    /// Network or lock failure; safe to retry.
    #[error("transient store error: {0}")]
    Transient(String),

    /// Constraint violation or malformed data; retrying cannot help.
    #[error("fatal store error: {0}")]
    Fatal(String),

    /// The per-call timeout elapsed; treated as transient.
    #[error("store call timed out after {0}ms")]
    Timeout(u64),
}

impl StoreError {
    /// Returns true if the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout(_))
    }
}

/// Errors that can occur inside the engine.
#[derive(Error, Debug)]
pub enum EngineError {
    /// A store client failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The durable journal could not be read or written.
    #[error("journal I/O error: {0}")]
    JournalIo(#[from] std::io::Error),

    /// A journal line other than the trailing one failed to parse.
    #[error("journal corrupt at line {line}: {message}")]
    JournalCorrupt {
        /// 1-based line number.
        line: usize,
        /// Parse failure detail.
        message: String,
    },

    /// Another process holds the journal lock.
    #[error("journal is locked by another process: {0}")]
    JournalLocked(String),

    /// A conflict requires manual resolution. Terminal for the
    /// operation, pending human input; not a processing failure.
    #[error("unresolved conflict for {key}")]
    ConflictUnresolved {
        /// The conflicting record.
        key: RecordKey,
    },

    /// Invalid configuration; startup must fail loudly.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// A protocol-level invariant was violated.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// An upsert event arrived without a payload.
    #[error("upsert event for {key} carries no payload")]
    MissingPayload {
        /// The affected record.
        key: RecordKey,
    },

    /// The engine is shutting down and accepts no new work.
    #[error("engine is shutting down")]
    ShuttingDown,
}

impl EngineError {
    /// Returns true if retrying the failed operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gesden_sync_protocol::SyncTable;

    #[test]
    fn transient_errors_are_retryable() {
        assert!(StoreError::Transient("connection reset".into()).is_retryable());
        assert!(StoreError::Timeout(5000).is_retryable());
        assert!(!StoreError::Fatal("unique constraint".into()).is_retryable());
    }

    #[test]
    fn engine_error_retryability_follows_store() {
        let e = EngineError::Store(StoreError::Transient("lock timeout".into()));
        assert!(e.is_retryable());

        let e = EngineError::Store(StoreError::Fatal("bad schema".into()));
        assert!(!e.is_retryable());

        let e = EngineError::Configuration("missing journal path".into());
        assert!(!e.is_retryable());
    }

    #[test]
    fn error_display() {
        let key = RecordKey::new(SyncTable::Pacientes, "p-7");
        let e = EngineError::ConflictUnresolved { key };
        assert_eq!(e.to_string(), "unresolved conflict for pacientes/p-7");
    }
}
