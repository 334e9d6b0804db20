//! Read endpoints for processed-event records.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use conflux_core::{DedupeKey, ProcessedEventRecord, ProcessedStatus, SourceService};
use conflux_core::storage::RecordFilter;
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::{handlers::webhooks::error_response, AppState};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

/// Query parameters for the event listing.
#[derive(Debug, Deserialize)]
pub struct ListQuery {
    /// 1-based page number.
    pub page: Option<i64>,
    /// Page size, capped at 200.
    pub per_page: Option<i64>,
    /// Filter by processing status.
    pub status: Option<String>,
    /// Filter by source service.
    pub service: Option<String>,
}

/// Paginated listing response.
#[derive(Debug, Serialize)]
pub struct PaginatedResponse {
    /// Records on this page, newest first.
    pub items: Vec<ProcessedEventRecord>,
    /// Total records matching the filter.
    pub total: i64,
    /// Current page, 1-based.
    pub page: i64,
    /// Page size used.
    pub per_page: i64,
    /// Total pages.
    pub pages: i64,
}

/// Lists processed-event records with optional status/service filters.
#[instrument(name = "list_events", skip(state))]
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Response {
    let filter = match build_filter(&query) {
        Ok(filter) => filter,
        Err(response) => return response,
    };

    let page = query.page.unwrap_or(1).max(1);
    let per_page = query.per_page.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = (page - 1) * per_page;

    let store = state.engine.store();
    let (items, total) = match tokio::try_join!(
        store.list(&filter, per_page, offset),
        store.count(&filter)
    ) {
        Ok(result) => result,
        Err(err) => {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "storage_unavailable",
                &err.to_string(),
            );
        },
    };

    let pages = if total == 0 { 0 } else { (total + per_page - 1) / per_page };

    (StatusCode::OK, Json(PaginatedResponse { items, total, page, per_page, pages }))
        .into_response()
}

/// Fetches one processed-event record by service and upstream event id.
#[instrument(name = "get_event", skip(state))]
pub async fn get_event(
    State(state): State<AppState>,
    Path((service, event_id)): Path<(String, String)>,
) -> Response {
    let Ok(service) = service.parse::<SourceService>() else {
        return error_response(
            StatusCode::NOT_FOUND,
            "unknown_service",
            &format!("unknown webhook source: {service}"),
        );
    };

    let key = DedupeKey::new(service, event_id);
    match state.engine.store().find(&key).await {
        Ok(Some(record)) => (StatusCode::OK, Json(record)).into_response(),
        Ok(None) => error_response(
            StatusCode::NOT_FOUND,
            "event_not_found",
            &format!("no record for {key}"),
        ),
        Err(err) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "storage_unavailable",
            &err.to_string(),
        ),
    }
}

/// Parses the filter query parameters, rejecting unknown values.
fn build_filter(query: &ListQuery) -> Result<RecordFilter, Response> {
    let status = match &query.status {
        None => None,
        Some(raw) => Some(raw.parse::<ProcessedStatus>().map_err(|_| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_filter",
                &format!("unknown status filter: {raw}"),
            )
        })?),
    };

    let service = match &query.service {
        None => None,
        Some(raw) => Some(raw.parse::<SourceService>().map_err(|_| {
            error_response(
                StatusCode::BAD_REQUEST,
                "invalid_filter",
                &format!("unknown service filter: {raw}"),
            )
        })?),
    };

    Ok(RecordFilter { status, service })
}
