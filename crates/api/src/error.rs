//! HTTP error mapping
//!
//! Status codes are chosen for the provider's retry logic: 4xx tells the
//! provider the delivery will never succeed, 503 asks it to redeliver, 5xx
//! signals our bug while the stored event waits for replay.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use siteforge_billing::BillingError;

#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct ApiError(#[from] pub BillingError);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            BillingError::SignatureInvalid => {
                (StatusCode::BAD_REQUEST, "invalid signature".to_string())
            }
            BillingError::UnknownProvider(name) => (
                StatusCode::BAD_REQUEST,
                format!("unknown provider: {}", name),
            ),
            BillingError::InvalidInput(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            BillingError::NotFound(what) => {
                (StatusCode::NOT_FOUND, format!("not found: {}", what))
            }
            BillingError::AlreadyProcessed => {
                (StatusCode::OK, "already processed".to_string())
            }
            BillingError::RetryExhausted => {
                (StatusCode::CONFLICT, "retry limit reached".to_string())
            }
            // Transient: the provider should redeliver.
            BillingError::TransientStore(_) => (
                StatusCode::SERVICE_UNAVAILABLE,
                "temporarily unavailable".to_string(),
            ),
            // Internal details stay in the logs.
            BillingError::Handler(_) | BillingError::Database(_) | BillingError::Config(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
            ),
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, status = %status, "Request failed");
        }
        (status, Json(json!({ "error": message }))).into_response()
    }
}
