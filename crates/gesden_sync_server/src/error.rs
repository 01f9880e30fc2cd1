//! Error types for the status server.

use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that can occur while serving a status API request.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Malformed request body or query parameter.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// No route matches the request path.
    #[error("not found: {0}")]
    NotFound(String),

    /// The path exists but not for this method.
    #[error("method {method} not allowed for {path}")]
    MethodNotAllowed {
        /// Request method.
        method: String,
        /// Request path.
        path: String,
    },

    /// The engine refused the request because it is shutting down.
    #[error("engine unavailable: {0}")]
    Unavailable(String),

    /// The engine failed while handling the request.
    #[error("engine error: {0}")]
    Engine(String),

    /// A response could not be encoded.
    #[error("encoding error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl ServerError {
    /// Maps the error to an HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            ServerError::InvalidRequest(_) => 400,
            ServerError::NotFound(_) => 404,
            ServerError::MethodNotAllowed { .. } => 405,
            ServerError::Unavailable(_) => 503,
            ServerError::Engine(_) | ServerError::Codec(_) => 500,
        }
    }

    /// Returns true if the caller is at fault.
    pub fn is_client_error(&self) -> bool {
        (400..500).contains(&self.http_status())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ServerError::InvalidRequest("bad".into()).http_status(), 400);
        assert_eq!(ServerError::NotFound("/x".into()).http_status(), 404);
        assert_eq!(
            ServerError::MethodNotAllowed {
                method: "DELETE".into(),
                path: "/sync/status".into(),
            }
            .http_status(),
            405
        );
        assert_eq!(ServerError::Unavailable("stopping".into()).http_status(), 503);
        assert_eq!(ServerError::Engine("boom".into()).http_status(), 500);
    }

    #[test]
    fn client_error_classification() {
        assert!(ServerError::InvalidRequest("bad".into()).is_client_error());
        assert!(!ServerError::Engine("boom".into()).is_client_error());
    }
}
