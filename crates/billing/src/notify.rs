//! Outbound notifications
//!
//! Signed webhooks to the operator's own endpoint for sales and dunning
//! reminders. Delivery is best-effort: failures are retried with backoff,
//! then logged and dropped. A notification failure must never fail the
//! inbound event that triggered it.

use std::sync::Arc;
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tokio_retry::strategy::ExponentialBackoff;
use tokio_retry::Retry;
use tracing::{info, warn};
use uuid::Uuid;

use crate::providers::Provider;

/// Header carrying the hex HMAC-SHA256 of the request body.
pub const SIGNATURE_HEADER: &str = "x-siteforge-signature";

const RETRY_BASE_MS: u64 = 200;
const MAX_RETRIES: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OutboundNotification {
    Sale {
        tenant_id: Uuid,
        provider: Provider,
        provider_subscription_id: String,
    },
    DunningReminder {
        tenant_id: Uuid,
        stage: i16,
        days_past_due: i64,
    },
}

impl OutboundNotification {
    fn kind(&self) -> &'static str {
        match self {
            OutboundNotification::Sale { .. } => "sale",
            OutboundNotification::DunningReminder { .. } => "dunning_reminder",
        }
    }
}

#[derive(Clone)]
pub struct Notifier {
    backend: NotifierBackend,
}

#[derive(Clone)]
enum NotifierBackend {
    Http {
        client: reqwest::Client,
        url: String,
        secret: String,
    },
    Memory(Arc<Mutex<Vec<OutboundNotification>>>),
    Disabled,
}

impl Notifier {
    pub fn new_http(url: String, secret: String) -> Self {
        Self {
            backend: NotifierBackend::Http {
                client: reqwest::Client::new(),
                url,
                secret,
            },
        }
    }

    /// Records notifications instead of sending them.
    pub fn new_in_memory() -> Self {
        Self {
            backend: NotifierBackend::Memory(Arc::new(Mutex::new(Vec::new()))),
        }
    }

    /// No-op notifier for deployments without an outbound endpoint.
    pub fn disabled() -> Self {
        Self {
            backend: NotifierBackend::Disabled,
        }
    }

    /// Deliver a notification. Never returns an error: delivery problems are
    /// logged after the retries are exhausted.
    pub async fn send(&self, notification: OutboundNotification) {
        match &self.backend {
            NotifierBackend::Http {
                client,
                url,
                secret,
            } => {
                let body = match serde_json::to_string(&notification) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(error = %e, "Failed to serialize outbound notification");
                        return;
                    }
                };
                let signature = sign(secret, &body);
                let strategy = ExponentialBackoff::from_millis(RETRY_BASE_MS)
                    .max_delay(Duration::from_secs(5))
                    .take(MAX_RETRIES);

                let result = Retry::spawn(strategy, || async {
                    let response = client
                        .post(url)
                        .header("content-type", "application/json")
                        .header(SIGNATURE_HEADER, &signature)
                        .body(body.clone())
                        .send()
                        .await?;
                    response.error_for_status()?;
                    Ok::<(), reqwest::Error>(())
                })
                .await;

                match result {
                    Ok(()) => {
                        info!(kind = notification.kind(), "Outbound notification delivered");
                    }
                    Err(e) => {
                        warn!(
                            kind = notification.kind(),
                            error = %e,
                            "Outbound notification dropped after retries"
                        );
                    }
                }
            }
            NotifierBackend::Memory(sent) => {
                sent.lock().await.push(notification);
            }
            NotifierBackend::Disabled => {}
        }
    }

    /// Notifications recorded by the in-memory backend. Empty for the other
    /// backends.
    pub async fn sent(&self) -> Vec<OutboundNotification> {
        match &self.backend {
            NotifierBackend::Memory(sent) => sent.lock().await.clone(),
            _ => Vec::new(),
        }
    }
}

fn sign(secret: &str, body: &str) -> String {
    // HMAC accepts keys of any length.
    #[allow(clippy::expect_used)]
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
