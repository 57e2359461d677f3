//! Inbound webhook endpoint
//!
//! One route per provider, raw body in hand before any JSON parsing so the
//! signature is checked over exactly the bytes the provider signed.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::Serialize;
use siteforge_billing::{IngestOutcome, Provider, SignatureHeaders};
use uuid::Uuid;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub duplicate: bool,
    pub storage_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
}

/// POST /webhooks/{provider}
///
/// Responds 200 for both first deliveries and duplicates so providers stop
/// redelivering; only signature failures and transient storage errors tell
/// the provider something is wrong.
pub async fn receive(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, ApiError> {
    let provider = Provider::parse(&provider)?;

    let signature_headers = SignatureHeaders {
        signature: header_value(&headers, provider.signature_header()),
        timestamp: provider
            .timestamp_header()
            .and_then(|name| header_value(&headers, name)),
    };

    let outcome = state
        .engine
        .pipeline
        .ingest(provider, &body, &signature_headers)
        .await?;

    let response = match outcome {
        IngestOutcome::Accepted {
            storage_id,
            summary,
        } => WebhookResponse {
            received: true,
            duplicate: false,
            storage_id: Some(storage_id),
            summary: Some(summary),
        },
        IngestOutcome::Duplicate { storage_id } => WebhookResponse {
            received: true,
            duplicate: true,
            storage_id,
            summary: None,
        },
    };
    Ok(Json(response))
}
