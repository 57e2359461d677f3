//! Webhook signature verification
//!
//! Validates that an inbound delivery genuinely originated from a trusted
//! provider and is fresh enough not to be a replay. All signature
//! comparisons run in constant time; a mismatch in the first byte costs the
//! same as a mismatch in the last.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use time::OffsetDateTime;

use crate::config::WebhookConfig;
use crate::error::{BillingError, BillingResult};
use crate::providers::Provider;

type HmacSha256 = Hmac<Sha256>;

/// Replay window: deliveries whose timestamp is more than this many seconds
/// away from the current time (in either direction) are rejected. A
/// timestamp at exactly the boundary is accepted.
pub const SIGNATURE_TOLERANCE_SECONDS: i64 = 300;

/// Signature-bearing headers extracted from the delivery, independent of
/// the HTTP framework.
#[derive(Debug, Clone, Default)]
pub struct SignatureHeaders {
    pub signature: Option<String>,
    pub timestamp: Option<String>,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct Verification {
    /// The provider's event id, extracted from the parsed body. `None` when
    /// the body does not parse as JSON or carries no id; the event store
    /// assigns a synthetic id in that case.
    pub provider_event_id: Option<String>,
}

#[derive(Clone)]
pub struct SignatureVerifier {
    config: WebhookConfig,
}

impl SignatureVerifier {
    pub fn new(config: WebhookConfig) -> Self {
        Self { config }
    }

    /// Verify a delivery against the provider's scheme using the wall clock.
    pub fn verify(
        &self,
        provider: Provider,
        raw_body: &[u8],
        headers: &SignatureHeaders,
    ) -> BillingResult<Verification> {
        self.verify_at(
            provider,
            raw_body,
            headers,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
    }

    /// Verify with an explicit clock; the freshness window is testable
    /// without sleeping.
    pub fn verify_at(
        &self,
        provider: Provider,
        raw_body: &[u8],
        headers: &SignatureHeaders,
        now_unix: i64,
    ) -> BillingResult<Verification> {
        let secret = self.config.secret_for(provider);

        match provider {
            Provider::Stripe => self.verify_stripe(secret, raw_body, headers, now_unix)?,
            Provider::Github => self.verify_github(secret, raw_body, headers)?,
            Provider::Slack => self.verify_slack(secret, raw_body, headers, now_unix)?,
        }

        // Id extraction happens only after the signature checks out. A body
        // that fails to parse as JSON is not a verification failure.
        let provider_event_id = serde_json::from_slice::<serde_json::Value>(raw_body)
            .ok()
            .and_then(|v| v.get("id").and_then(|id| id.as_str().map(String::from)));

        Ok(Verification { provider_event_id })
    }

    /// `t=<unix>,v1=<hex>`, HMAC-SHA256 over `"<t>.<body>"`.
    fn verify_stripe(
        &self,
        secret: &str,
        raw_body: &[u8],
        headers: &SignatureHeaders,
        now_unix: i64,
    ) -> BillingResult<()> {
        let header = headers
            .signature
            .as_deref()
            .ok_or(BillingError::SignatureInvalid)?;

        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<&str> = None;
        for part in header.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1]),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or(BillingError::SignatureInvalid)?;
        let v1_signature = v1_signature.ok_or(BillingError::SignatureInvalid)?;

        check_freshness(timestamp, now_unix)?;

        let mut signed_payload = format!("{}.", timestamp).into_bytes();
        signed_payload.extend_from_slice(raw_body);
        let expected = hmac_sha256(secret, &signed_payload)?;

        verify_hex_signature(v1_signature, &expected)
    }

    /// `sha256=<hex>` over the raw body. Any other digest prefix (including
    /// the deprecated `sha1=`) is rejected.
    fn verify_github(
        &self,
        secret: &str,
        raw_body: &[u8],
        headers: &SignatureHeaders,
    ) -> BillingResult<()> {
        let header = headers
            .signature
            .as_deref()
            .ok_or(BillingError::SignatureInvalid)?;

        let hex_sig = header
            .strip_prefix("sha256=")
            .ok_or(BillingError::SignatureInvalid)?;

        let expected = hmac_sha256(secret, raw_body)?;
        verify_hex_signature(hex_sig, &expected)
    }

    /// `v0=<hex>` over `"v0:<timestamp>:<body>"`, timestamp in its own
    /// header, same freshness rule as Stripe.
    fn verify_slack(
        &self,
        secret: &str,
        raw_body: &[u8],
        headers: &SignatureHeaders,
        now_unix: i64,
    ) -> BillingResult<()> {
        let header = headers
            .signature
            .as_deref()
            .ok_or(BillingError::SignatureInvalid)?;
        let timestamp_str = headers
            .timestamp
            .as_deref()
            .ok_or(BillingError::SignatureInvalid)?;
        let timestamp: i64 = timestamp_str
            .parse()
            .map_err(|_| BillingError::SignatureInvalid)?;

        check_freshness(timestamp, now_unix)?;

        let hex_sig = header
            .strip_prefix("v0=")
            .ok_or(BillingError::SignatureInvalid)?;

        let mut base_string = format!("v0:{}:", timestamp_str).into_bytes();
        base_string.extend_from_slice(raw_body);
        let expected = hmac_sha256(secret, &base_string)?;

        verify_hex_signature(hex_sig, &expected)
    }
}

fn check_freshness(timestamp: i64, now_unix: i64) -> BillingResult<()> {
    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECONDS {
        return Err(BillingError::SignatureInvalid);
    }
    Ok(())
}

fn hmac_sha256(secret: &str, message: &[u8]) -> BillingResult<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::SignatureInvalid)?;
    mac.update(message);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Decode the received hex signature and compare against the expected MAC
/// bytes in constant time.
fn verify_hex_signature(received_hex: &str, expected: &[u8]) -> BillingResult<()> {
    let received = hex::decode(received_hex).map_err(|_| BillingError::SignatureInvalid)?;
    if received.len() != expected.len() {
        return Err(BillingError::SignatureInvalid);
    }
    if bool::from(received.ct_eq(expected)) {
        Ok(())
    } else {
        Err(BillingError::SignatureInvalid)
    }
}
