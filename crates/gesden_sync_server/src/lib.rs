//! # GESDEN Sync Server
//!
//! Operator status API for the GESDEN sync bridge.
//!
//! This crate provides:
//! - `GET /sync/status`: engine, health, conflict and queue state
//! - `POST /sync/force`: full reconciliation pass (optionally one table)
//! - `GET /alerts`: alert list with `status` and `type` filters
//! - `POST /alerts/{id}/acknowledge` and `POST /alerts/{id}/resolve`
//!
//! # Architecture
//!
//! The server is transport-agnostic: [`StatusServer::handle`] takes
//! method, path, query and body bytes and returns a status code plus a
//! JSON body. The embedding HTTP stack does no routing or decoding of
//! its own. The server depends on the engine only through the
//! [`EngineControl`](gesden_sync_engine::EngineControl) trait, so it
//! can be tested against a stub.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod error;
mod handler;
mod server;

pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use handler::RequestHandler;
pub use server::{Response, StatusServer};
