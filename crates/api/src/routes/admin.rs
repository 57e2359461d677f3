//! Operational admin routes
//!
//! Event inspection, manual replay, and entitlement lookups. Exposed on the
//! internal network only; there is no tenant-facing surface here.

use axum::extract::{Path, Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use siteforge_billing::{
    BillingError, Entitlements, EventStatus, InboundEvent, ReplayOutcome,
};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct EventListResponse {
    pub events: Vec<InboundEvent>,
    pub limit: i64,
    pub offset: i64,
}

/// GET /admin/webhook-events?status=failed&limit=50&offset=0
pub async fn list_events(
    State(state): State<AppState>,
    Query(query): Query<ListEventsQuery>,
) -> Result<Json<EventListResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(EventStatus::parse)
        .transpose()
        .map_err(|_| {
            BillingError::InvalidInput(format!(
                "unknown status filter: {}",
                query.status.as_deref().unwrap_or_default()
            ))
        })?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset.unwrap_or(0).max(0);

    let events = state.engine.events.list(status, limit, offset).await?;
    Ok(Json(EventListResponse {
        events,
        limit,
        offset,
    }))
}

/// POST /admin/webhook-events/{id}/replay
pub async fn replay_event(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ReplayOutcome>, ApiError> {
    let outcome = state.engine.replay.replay(id).await?;
    tracing::info!(
        storage_id = %id,
        accepted = outcome.accepted,
        "Manual replay requested"
    );
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct ReplayFailedQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct ReplayFailedResponse {
    pub attempted: usize,
    pub outcomes: Vec<ReplayOutcome>,
}

/// POST /admin/webhook-events/replay-failed
pub async fn replay_failed(
    State(state): State<AppState>,
    Query(query): Query<ReplayFailedQuery>,
) -> Result<Json<ReplayFailedResponse>, ApiError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);
    let outcomes = state.engine.replay.replay_all_failed(limit).await?;
    tracing::info!(attempted = outcomes.len(), "Bulk replay of failed events");
    Ok(Json(ReplayFailedResponse {
        attempted: outcomes.len(),
        outcomes,
    }))
}

/// GET /admin/tenants/{tenant_id}/entitlements
pub async fn tenant_entitlements(
    State(state): State<AppState>,
    Path(tenant_id): Path<Uuid>,
) -> Result<Json<Entitlements>, ApiError> {
    let entitlements = state.engine.entitlements.resolve(tenant_id).await?;
    Ok(Json(entitlements))
}
