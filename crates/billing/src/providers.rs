//! Webhook providers
//!
//! A closed set of providers, one variant per verification scheme. Adding a
//! provider means adding a variant here and a secret to `WebhookConfig`;
//! call sites dispatch on the enum, never on raw strings.

use serde::{Deserialize, Serialize};

use crate::error::{BillingError, BillingResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Timestamp-prefixed HMAC: `t=<unix>,v1=<hex>` over `"<t>.<body>"`.
    Stripe,
    /// Prefixed-digest HMAC: `sha256=<hex>` over the raw body.
    Github,
    /// Timestamp + signed base string: `v0=<hex>` over `"v0:<ts>:<body>"`,
    /// timestamp in a separate header.
    Slack,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Stripe => "stripe",
            Provider::Github => "github",
            Provider::Slack => "slack",
        }
    }

    /// Parse a provider name. An unknown name is a configuration error and
    /// fails closed, distinct from a signature validation failure.
    pub fn parse(name: &str) -> BillingResult<Self> {
        match name {
            "stripe" => Ok(Provider::Stripe),
            "github" => Ok(Provider::Github),
            "slack" => Ok(Provider::Slack),
            other => Err(BillingError::UnknownProvider(other.to_string())),
        }
    }

    /// Name of the HTTP header carrying the signature.
    pub fn signature_header(&self) -> &'static str {
        match self {
            Provider::Stripe => "stripe-signature",
            Provider::Github => "x-hub-signature-256",
            Provider::Slack => "x-slack-signature",
        }
    }

    /// Name of the separate timestamp header, if the scheme uses one.
    pub fn timestamp_header(&self) -> Option<&'static str> {
        match self {
            Provider::Slack => Some("x-slack-request-timestamp"),
            _ => None,
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_providers() {
        assert_eq!(Provider::parse("stripe").unwrap(), Provider::Stripe);
        assert_eq!(Provider::parse("github").unwrap(), Provider::Github);
        assert_eq!(Provider::parse("slack").unwrap(), Provider::Slack);
    }

    #[test]
    fn test_unknown_provider_fails_closed() {
        let err = Provider::parse("paypal").unwrap_err();
        assert!(matches!(err, BillingError::UnknownProvider(name) if name == "paypal"));
    }

    #[test]
    fn test_header_names() {
        assert_eq!(Provider::Stripe.signature_header(), "stripe-signature");
        assert_eq!(Provider::Github.signature_header(), "x-hub-signature-256");
        assert_eq!(
            Provider::Slack.timestamp_header(),
            Some("x-slack-request-timestamp")
        );
        assert_eq!(Provider::Stripe.timestamp_header(), None);
    }
}
