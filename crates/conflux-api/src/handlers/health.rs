//! Health endpoints: service probes and per-integration status.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use conflux_core::now_utc;
use serde::Serialize;
use tracing::{debug, error, instrument};

use crate::AppState;

/// Service health response.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: ServiceStatus,
    /// When the check ran.
    pub timestamp: DateTime<Utc>,
    /// Component checks.
    pub checks: HealthChecks,
    /// Service version.
    pub version: String,
}

/// Overall service status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    /// All components operational.
    Healthy,
    /// Critical components failing.
    Unhealthy,
}

/// Per-component health results.
#[derive(Debug, Serialize)]
pub struct HealthChecks {
    /// Database connectivity.
    pub database: ComponentHealth,
}

/// One component's health.
#[derive(Debug, Serialize)]
pub struct ComponentHealth {
    /// `up` or `down`.
    pub status: ComponentStatus,
    /// Failure detail when down.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Component-level status.
#[derive(Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is reachable.
    Up,
    /// Component is failing.
    Down,
}

/// Service health check including database connectivity.
///
/// When the service runs without a database (in-memory test wiring), the
/// database check reports up: there is nothing to lose connectivity to.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let database = match &state.storage {
        Some(storage) => match storage.health_check().await {
            Ok(()) => ComponentHealth { status: ComponentStatus::Up, message: None },
            Err(err) => {
                error!(error = %err, "database health check failed");
                ComponentHealth {
                    status: ComponentStatus::Down,
                    message: Some(format!("database connection failed: {err}")),
                }
            },
        },
        None => ComponentHealth { status: ComponentStatus::Up, message: None },
    };

    let (status, status_code) = match database.status {
        ComponentStatus::Up => (ServiceStatus::Healthy, StatusCode::OK),
        ComponentStatus::Down => (ServiceStatus::Unhealthy, StatusCode::SERVICE_UNAVAILABLE),
    };

    let response = HealthResponse {
        status,
        timestamp: now_utc(state.clock.as_ref()),
        checks: HealthChecks { database },
        version: env!("CARGO_PKG_VERSION").to_string(),
    };

    (status_code, Json(response)).into_response()
}

/// Readiness probe. Identical to the health check.
#[instrument(name = "readiness_check", skip(state))]
pub async fn readiness_check(State(state): State<AppState>) -> Response {
    health_check(State(state)).await
}

/// Liveness probe: the process is up and serving.
#[instrument(name = "liveness_check", skip(state))]
pub async fn liveness_check(State(state): State<AppState>) -> Response {
    debug!("liveness check");

    let response = serde_json::json!({
        "status": "alive",
        "timestamp": now_utc(state.clock.as_ref()),
        "service": "conflux-api",
    });

    (StatusCode::OK, Json(response)).into_response()
}

/// Per-service integration health derived from circuit state and recent
/// call outcomes.
#[instrument(name = "integration_health", skip(state))]
pub async fn integration_health(State(state): State<AppState>) -> Response {
    let health = state.engine.health().snapshot().await;
    (StatusCode::OK, Json(health)).into_response()
}
