//! Error types for protocol operations.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while working with protocol types.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Two payloads belong to different tables.
    #[error("table mismatch: expected {expected}, got {actual}")]
    TableMismatch {
        /// The table that was expected.
        expected: String,
        /// The table that was found.
        actual: String,
    },

    /// A table name could not be parsed.
    #[error("unknown table: {0}")]
    UnknownTable(String),

    /// A JSON message could not be encoded or decoded.
    #[error("message codec error: {0}")]
    Codec(#[from] serde_json::Error),

    /// A message was structurally invalid.
    #[error("invalid message: {0}")]
    InvalidMessage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::UnknownTable("facturas".into());
        assert_eq!(err.to_string(), "unknown table: facturas");

        let err = ProtocolError::TableMismatch {
            expected: "pacientes".into(),
            actual: "citas".into(),
        };
        assert!(err.to_string().contains("pacientes"));
        assert!(err.to_string().contains("citas"));
    }
}
