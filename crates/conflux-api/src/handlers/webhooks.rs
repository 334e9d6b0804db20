//! Webhook intake handler.
//!
//! Accepts raw upstream payloads on `POST /webhooks/{service}` and drives
//! them through the integration engine. Intake-level failures map to HTTP
//! status codes; anything after acceptance is handled asynchronously and
//! never fails the response.

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use bytes::Bytes;
use conflux_core::SourceService;
use conflux_engine::{EngineError, ProcessingResult, RawDelivery};
use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::AppState;

/// Response for an accepted webhook.
#[derive(Debug, Serialize)]
pub struct IngestResponse {
    /// Upstream event identifier.
    pub event_id: String,
    /// Service the event came from.
    pub service: String,
    /// Processing outcome: `applied`, `duplicate_applied`, `deferred`, or
    /// `ignored`.
    pub status: String,
    /// Rejection reason, present only for ignored events.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details.
    pub error: ErrorDetail,
}

/// Structured error detail.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Stable error code.
    pub code: String,
    /// Human-readable description.
    pub message: String,
}

/// Ingests a webhook from one of the external services.
#[instrument(
    name = "ingest_webhook",
    skip(state, headers, body),
    fields(service = %service, payload_size = body.len())
)]
pub async fn ingest_webhook(
    Path(service): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(service) = service.parse::<SourceService>() else {
        return error_response(
            StatusCode::NOT_FOUND,
            "unknown_service",
            &format!("unknown webhook source: {service}"),
        );
    };

    let tenant_header = headers.get("x-tenant-id").and_then(|v| v.to_str().ok());
    let signature = headers.get("x-webhook-signature").and_then(|v| v.to_str().ok());
    let delivery = RawDelivery { body: &body, tenant_header, signature };

    match state.engine.ingest(service, delivery).await {
        Ok((event, result)) => {
            info!(
                event_id = %event.event_id,
                tenant_id = %event.tenant_id,
                status = result.as_str(),
                "webhook accepted"
            );

            let reason = match &result {
                ProcessingResult::Ignored { reason } => Some(reason.clone()),
                _ => None,
            };

            (
                StatusCode::OK,
                Json(IngestResponse {
                    event_id: event.event_id,
                    service: service.to_string(),
                    status: result.as_str().to_string(),
                    reason,
                }),
            )
                .into_response()
        },
        Err(err) => {
            warn!(error = %err, "webhook rejected at intake");
            engine_error_response(&err)
        },
    }
}

/// Maps intake-level engine errors to HTTP responses.
fn engine_error_response(err: &EngineError) -> Response {
    let (status, code) = match err {
        EngineError::MalformedEvent { .. } => (StatusCode::BAD_REQUEST, "malformed_event"),
        EngineError::InvalidSignature { .. } => (StatusCode::UNAUTHORIZED, "invalid_signature"),
        EngineError::ConcurrentProcessing { .. } => {
            (StatusCode::CONFLICT, "concurrent_processing")
        },
        EngineError::StorageUnavailable { .. } => {
            (StatusCode::SERVICE_UNAVAILABLE, "storage_unavailable")
        },
        _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
    };

    error_response(status, code, &err.to_string())
}

/// Builds a structured error response.
pub(crate) fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail { code: code.to_string(), message: message.to_string() },
        }),
    )
        .into_response()
}
