//! HTTP surface for the conflux integration engine.
//!
//! Exposes webhook intake (`POST /webhooks/{service}`), the processed-event
//! listing, per-service integration health, and orchestrator probes. All
//! processing goes through [`conflux_engine::IntegrationEngine`]; this crate
//! is routing, extraction, and status-code mapping.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use conflux_core::{storage::Storage, Clock};
use conflux_engine::IntegrationEngine;

pub mod config;
pub mod handlers;
pub mod server;

pub use config::Config;
pub use server::{create_router, start_server};

/// Shared state for all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The integration engine.
    pub engine: Arc<IntegrationEngine>,
    /// Database storage, for the health endpoint. `None` when the service
    /// runs on in-memory wiring (tests).
    pub storage: Option<Storage>,
    /// Time source shared with the engine.
    pub clock: Arc<dyn Clock>,
}

impl AppState {
    /// Creates the state for production wiring.
    pub fn new(engine: Arc<IntegrationEngine>, storage: Storage, clock: Arc<dyn Clock>) -> Self {
        Self { engine, storage: Some(storage), clock }
    }

    /// Creates state without a database, for in-memory test wiring.
    pub fn without_storage(engine: Arc<IntegrationEngine>, clock: Arc<dyn Clock>) -> Self {
        Self { engine, storage: None, clock }
    }
}
