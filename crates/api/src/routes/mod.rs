//! HTTP route tree

pub mod admin;
pub mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/{provider}", post(webhooks::receive))
        .route("/admin/webhook-events", get(admin::list_events))
        .route(
            "/admin/webhook-events/{id}/replay",
            post(admin::replay_event),
        )
        .route(
            "/admin/webhook-events/replay-failed",
            post(admin::replay_failed),
        )
        .route(
            "/admin/tenants/{tenant_id}/entitlements",
            get(admin::tenant_entitlements),
        )
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}
