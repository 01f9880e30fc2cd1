//! Status server configuration.

/// Configuration for the status API server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address the embedding HTTP stack should bind to.
    pub bind_addr: String,
    /// Maximum accepted request body size in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            max_body_bytes: 64 * 1024,
        }
    }
}

impl ServerConfig {
    /// Sets the bind address.
    pub fn with_bind_addr(mut self, addr: impl Into<String>) -> Self {
        self.bind_addr = addr.into();
        self
    }

    /// Sets the maximum request body size.
    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }
}
