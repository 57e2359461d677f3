//! Idempotency ledger
//!
//! Fast-path duplicate suppression keyed by `(provider, provider_event_id)`.
//! The ledger is a cache in front of the durable event store, never the
//! source of truth: entries are written only *after* an event has been fully
//! applied, and a ledger outage degrades to the event store's persistent
//! status check.

use serde::{Deserialize, Serialize};
use siteforge_shared::KvStore;
use time::OffsetDateTime;

use crate::error::{truncate_error, BillingResult};
use crate::providers::Provider;

/// Entries expire after 7 days. A duplicate delivered later than that falls
/// through to the event store's persistent idempotency check.
pub const IDEMPOTENCY_TTL_SECONDS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unix timestamp of when the event finished processing.
    pub processed_at: i64,
    /// Cached (truncated) processing result.
    pub result: Option<String>,
}

#[derive(Clone)]
pub struct IdempotencyLedger {
    kv: KvStore,
}

impl IdempotencyLedger {
    pub fn new(kv: KvStore) -> Self {
        Self { kv }
    }

    fn key(provider: Provider, provider_event_id: &str) -> String {
        format!("idempo:{}:{}", provider, provider_event_id)
    }

    /// Whether this event has already been fully applied. Errors surface as
    /// `TransientStore`; the caller decides whether to fall back to the
    /// event store.
    pub async fn is_processed(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> BillingResult<bool> {
        let value = self.kv.get(&Self::key(provider, provider_event_id)).await?;
        Ok(value.is_some())
    }

    /// The cached entry, if any.
    pub async fn entry(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> BillingResult<Option<LedgerEntry>> {
        let value = self.kv.get(&Self::key(provider, provider_event_id)).await?;
        Ok(value.and_then(|v| serde_json::from_str(&v).ok()))
    }

    /// Record that the event has been fully applied. Called only after all
    /// downstream effects succeeded; writing earlier could mark an event
    /// processed whose effects never happened.
    pub async fn mark_processed(
        &self,
        provider: Provider,
        provider_event_id: &str,
        result: Option<&str>,
    ) -> BillingResult<()> {
        let entry = LedgerEntry {
            processed_at: OffsetDateTime::now_utc().unix_timestamp(),
            result: result.map(truncate_error),
        };
        let serialized = serde_json::to_string(&entry)
            .map_err(|e| crate::error::BillingError::InvalidInput(e.to_string()))?;
        self.kv
            .put(
                &Self::key(provider, provider_event_id),
                &serialized,
                Some(IDEMPOTENCY_TTL_SECONDS),
            )
            .await?;
        Ok(())
    }
}
