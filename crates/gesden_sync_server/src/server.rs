//! Transport-agnostic request dispatch.
//!
//! The server exposes one entry point, [`StatusServer::handle`],
//! taking method, path, query string and body bytes. Whatever HTTP
//! stack embeds it only moves opaque bytes; every route decision and
//! status code lives here and is testable without a socket.

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::handler::RequestHandler;
use gesden_sync_engine::EngineControl;
use gesden_sync_protocol::{AlertQuery, ForceSyncRequest};
use serde_json::json;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// A ready-to-send response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,
    /// JSON body bytes.
    pub body: Vec<u8>,
}

impl Response {
    fn json<T: serde::Serialize>(status: u16, value: &T) -> ServerResult<Self> {
        Ok(Self {
            status,
            body: serde_json::to_vec(value)?,
        })
    }

    fn from_error(error: &ServerError) -> Self {
        let body = json!({ "error": error.to_string() });
        Self {
            status: error.http_status(),
            // Serializing a two-field literal cannot fail.
            body: serde_json::to_vec(&body).unwrap_or_default(),
        }
    }
}

/// The operator status API server.
pub struct StatusServer {
    handler: RequestHandler,
}

impl StatusServer {
    /// Creates a server over an engine control surface.
    pub fn new(engine: Arc<dyn EngineControl>, config: ServerConfig) -> Self {
        Self {
            handler: RequestHandler::new(engine, config),
        }
    }

    /// Dispatches one request. Never panics; every failure maps to a
    /// status code and a JSON error body.
    pub fn handle(&self, method: &str, path: &str, query: &str, body: &[u8]) -> Response {
        debug!(method, path, "status api request");
        match self.route(method, path, query, body) {
            Ok(response) => response,
            Err(e) => Response::from_error(&e),
        }
    }

    fn route(&self, method: &str, path: &str, query: &str, body: &[u8]) -> ServerResult<Response> {
        if body.len() > self.handler.config().max_body_bytes {
            return Err(ServerError::InvalidRequest(format!(
                "body exceeds {} bytes",
                self.handler.config().max_body_bytes
            )));
        }

        let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
        match (method, segments.as_slice()) {
            ("GET", ["sync", "status"]) => Response::json(200, &self.handler.handle_status()),
            ("POST", ["sync", "force"]) => {
                let request: ForceSyncRequest = decode_body(body)?;
                let report = self.handler.handle_force_sync(request)?;
                Response::json(200, &report)
            }
            ("GET", ["alerts"]) => {
                let alert_query = parse_alert_query(query)?;
                Response::json(200, &self.handler.handle_list_alerts(alert_query))
            }
            ("POST", ["alerts", id, "acknowledge"]) => {
                let id = parse_alert_id(id)?;
                Response::json(200, &self.handler.handle_acknowledge(id)?)
            }
            ("POST", ["alerts", id, "resolve"]) => {
                let id = parse_alert_id(id)?;
                Response::json(200, &self.handler.handle_resolve(id)?)
            }
            (_, ["sync", "status"] | ["sync", "force"] | ["alerts", ..]) => {
                Err(ServerError::MethodNotAllowed {
                    method: method.to_string(),
                    path: path.to_string(),
                })
            }
            _ => Err(ServerError::NotFound(path.to_string())),
        }
    }
}

fn decode_body<T: serde::de::DeserializeOwned + Default>(body: &[u8]) -> ServerResult<T> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ServerError::InvalidRequest(e.to_string()))
}

fn parse_alert_id(raw: &str) -> ServerResult<Uuid> {
    Uuid::from_str(raw).map_err(|e| ServerError::InvalidRequest(format!("bad alert id: {e}")))
}

/// Parses `status=...&type=...` into an [`AlertQuery`].
fn parse_alert_query(query: &str) -> ServerResult<AlertQuery> {
    let mut parsed = AlertQuery::default();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| ServerError::InvalidRequest(format!("bad query pair: {pair}")))?;
        match key {
            "status" => {
                parsed.status = Some(
                    value
                        .parse()
                        .map_err(|e| ServerError::InvalidRequest(format!("{e}")))?,
                );
            }
            "type" => {
                parsed.kind = Some(
                    value
                        .parse()
                        .map_err(|e| ServerError::InvalidRequest(format!("{e}")))?,
                );
            }
            other => {
                return Err(ServerError::InvalidRequest(format!(
                    "unknown query parameter: {other}"
                )));
            }
        }
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gesden_sync_engine::{EngineConfig, MemoryStore, SyncEngine};
    use gesden_sync_protocol::{
        AlertListResponse, ForceSyncReport, PatientRecord, RecordPayload, StatusResponse,
        StoreSide,
    };
    use tempfile::tempdir;

    fn server() -> (StatusServer, Arc<MemoryStore>, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let sql_server = Arc::new(MemoryStore::new(StoreSide::SqlServer));
        let postgres = Arc::new(MemoryStore::new(StoreSide::Postgres));
        let engine = Arc::new(
            SyncEngine::new(
                EngineConfig::new(dir.path().join("journal.jsonl")),
                sql_server.clone(),
                postgres,
            )
            .unwrap(),
        );
        (
            StatusServer::new(engine, ServerConfig::default()),
            sql_server,
            dir,
        )
    }

    fn decode<T: serde::de::DeserializeOwned>(response: &Response) -> T {
        serde_json::from_slice(&response.body).unwrap()
    }

    #[test]
    fn status_endpoint() {
        let (server, _, _dir) = server();
        let response = server.handle("GET", "/sync/status", "", b"");
        assert_eq!(response.status, 200);

        let status: StatusResponse = decode(&response);
        assert_eq!(status.engine_state, "idle");
    }

    #[test]
    fn force_sync_endpoint_accepts_empty_and_table_bodies() {
        let (server, sql_server, _dir) = server();
        sql_server.seed(RecordPayload::Pacientes(PatientRecord::new(
            "p-1",
            "Ana",
            "García",
            chrono::Utc::now(),
        )));

        let response = server.handle("POST", "/sync/force", "", b"");
        assert_eq!(response.status, 200);
        let report: ForceSyncReport = decode(&response);
        assert_eq!(report.enqueued, 1);

        let response = server.handle("POST", "/sync/force", "", br#"{"table":"citas"}"#);
        assert_eq!(response.status, 200);
        let report: ForceSyncReport = decode(&response);
        assert_eq!(report.examined, 0);
    }

    #[test]
    fn alerts_endpoint_filters() {
        let (server, _, _dir) = server();
        let response = server.handle("GET", "/alerts", "status=active", b"");
        assert_eq!(response.status, 200);
        let list: AlertListResponse = decode(&response);
        assert!(list.alerts.is_empty());

        let response = server.handle("GET", "/alerts", "status=nonsense", b"");
        assert_eq!(response.status, 400);

        let response = server.handle("GET", "/alerts", "color=red", b"");
        assert_eq!(response.status, 400);
    }

    #[test]
    fn alert_actions_404_on_unknown_id() {
        let (server, _, _dir) = server();
        let id = Uuid::new_v4();
        let response = server.handle("POST", &format!("/alerts/{id}/acknowledge"), "", b"");
        assert_eq!(response.status, 404);

        let response = server.handle("POST", "/alerts/not-a-uuid/resolve", "", b"");
        assert_eq!(response.status, 400);
    }

    #[test]
    fn routing_errors() {
        let (server, _, _dir) = server();
        assert_eq!(server.handle("GET", "/nope", "", b"").status, 404);
        assert_eq!(server.handle("DELETE", "/sync/status", "", b"").status, 405);
        assert_eq!(server.handle("GET", "/sync/force", "", b"").status, 405);
    }

    #[test]
    fn oversized_body_is_rejected() {
        let (server, _, _dir) = server();
        let body = vec![b' '; ServerConfig::default().max_body_bytes + 1];
        let response = server.handle("POST", "/sync/force", "", &body);
        assert_eq!(response.status, 400);
    }

    #[test]
    fn malformed_body_is_rejected() {
        let (server, _, _dir) = server();
        let response = server.handle("POST", "/sync/force", "", b"{not json");
        assert_eq!(response.status, 400);
    }
}
