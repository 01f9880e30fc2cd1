//! Request handlers for the operator endpoints.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use gesden_sync_engine::{EngineControl, EngineError};
use gesden_sync_protocol::{
    AlertActionResponse, AlertListResponse, AlertQuery, ForceSyncReport, ForceSyncRequest,
    StatusResponse,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Handles decoded operator requests against the engine.
///
/// The handler depends on [`EngineControl`] only, so tests can drive
/// it with a stub instead of a full engine.
pub struct RequestHandler {
    engine: Arc<dyn EngineControl>,
    config: ServerConfig,
}

impl RequestHandler {
    /// Creates a handler over an engine control surface.
    pub fn new(engine: Arc<dyn EngineControl>, config: ServerConfig) -> Self {
        Self { engine, config }
    }

    /// Server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// `GET /sync/status`
    pub fn handle_status(&self) -> StatusResponse {
        self.engine.status()
    }

    /// `POST /sync/force`
    pub fn handle_force_sync(&self, request: ForceSyncRequest) -> ServerResult<ForceSyncReport> {
        info!(table = ?request.table, "force sync requested");
        self.engine.force_sync(&request).map_err(|e| match e {
            EngineError::ShuttingDown => ServerError::Unavailable(e.to_string()),
            other => ServerError::Engine(other.to_string()),
        })
    }

    /// `GET /alerts`
    pub fn handle_list_alerts(&self, query: AlertQuery) -> AlertListResponse {
        AlertListResponse {
            alerts: self.engine.list_alerts(&query),
        }
    }

    /// `POST /alerts/{id}/acknowledge`
    pub fn handle_acknowledge(&self, id: Uuid) -> ServerResult<AlertActionResponse> {
        let alert = self
            .engine
            .acknowledge_alert(id)
            .ok_or_else(|| ServerError::NotFound(format!("alert {id}")))?;
        info!(alert = %id, "alert acknowledged");
        Ok(AlertActionResponse { alert })
    }

    /// `POST /alerts/{id}/resolve`
    pub fn handle_resolve(&self, id: Uuid) -> ServerResult<AlertActionResponse> {
        let alert = self
            .engine
            .resolve_alert(id)
            .ok_or_else(|| ServerError::NotFound(format!("alert {id}")))?;
        info!(alert = %id, "alert resolved");
        Ok(AlertActionResponse { alert })
    }
}
