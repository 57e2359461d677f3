//! Webhook engine configuration
//!
//! Secrets are injected through this struct at construction time rather than
//! read from the environment inside handler bodies. Tests construct a config
//! with fake secrets and never touch process-wide state.

use std::path::PathBuf;

use crate::error::{BillingError, BillingResult};
use crate::providers::Provider;

#[derive(Debug, Clone)]
pub struct WebhookConfig {
    /// Shared secret for Stripe-style `t=<unix>,v1=<hex>` signatures.
    pub stripe_webhook_secret: String,
    /// Shared secret for GitHub-style `sha256=<hex>` signatures.
    pub github_webhook_secret: String,
    /// Signing secret for Slack-style `v0=<hex>` signatures.
    pub slack_signing_secret: String,

    /// Where to POST the outbound sale/dunning notification. `None`
    /// disables outbound notifications entirely.
    pub outbound_webhook_url: Option<String>,
    /// Local HMAC secret used to sign outbound notifications.
    pub outbound_webhook_secret: String,

    /// Root directory for offloaded webhook payloads. `None` keeps offloaded
    /// blobs in memory (tests, single-process development).
    pub blob_root: Option<PathBuf>,
}

impl WebhookConfig {
    /// Load from environment variables. Missing provider secrets are a
    /// startup error: running with an empty secret would accept forged
    /// signatures for the empty key.
    pub fn from_env() -> BillingResult<Self> {
        let stripe_webhook_secret = require_env("STRIPE_WEBHOOK_SECRET")?;
        let github_webhook_secret = require_env("GITHUB_WEBHOOK_SECRET")?;
        let slack_signing_secret = require_env("SLACK_SIGNING_SECRET")?;

        Ok(Self {
            stripe_webhook_secret,
            github_webhook_secret,
            slack_signing_secret,
            outbound_webhook_url: std::env::var("SALE_WEBHOOK_URL").ok(),
            outbound_webhook_secret: std::env::var("SALE_WEBHOOK_SECRET").unwrap_or_default(),
            blob_root: std::env::var("WEBHOOK_BLOB_ROOT").ok().map(PathBuf::from),
        })
    }

    /// Fixed fake secrets for tests.
    pub fn for_tests() -> Self {
        Self {
            stripe_webhook_secret: "whsec_test123secret456".to_string(),
            github_webhook_secret: "ghsec_test789".to_string(),
            slack_signing_secret: "slacksec_testabc".to_string(),
            outbound_webhook_url: None,
            outbound_webhook_secret: "outbound_test".to_string(),
            blob_root: None,
        }
    }

    /// The shared secret for a provider's verification scheme.
    pub fn secret_for(&self, provider: Provider) -> &str {
        match provider {
            Provider::Stripe => &self.stripe_webhook_secret,
            Provider::Github => &self.github_webhook_secret,
            Provider::Slack => &self.slack_signing_secret,
        }
    }
}

fn require_env(name: &str) -> BillingResult<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => Err(BillingError::Config(format!("{} must be set", name))),
    }
}
