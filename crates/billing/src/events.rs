//! Durable webhook event store
//!
//! Every verified delivery is persisted before any side effect runs, so a
//! crash mid-processing can always be replayed from the stored payload.
//! Payloads are redacted before they are written and oversized payloads are
//! offloaded to blob storage with a pointer left inline.
//!
//! Backed by Postgres in production and an in-process map in tests; both
//! backends implement the same dedup and status-transition semantics.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::blob::{payload_key, BlobStore};
use crate::error::{truncate_error, BillingError, BillingResult};
use crate::providers::Provider;
use crate::redact::{redact_payload, sanitize_event_type};

/// Serialized payloads at or above this size are offloaded to blob storage.
pub const INLINE_PAYLOAD_LIMIT: usize = 64 * 1024;

/// Events stuck in `processing` longer than this are presumed crashed and
/// flipped to `failed` so the replay path can pick them up.
pub const STUCK_PROCESSING_MINUTES: i64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Processed => "processed",
            EventStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "processed" => Ok(EventStatus::Processed),
            "failed" => Ok(EventStatus::Failed),
            other => Err(BillingError::Database(format!(
                "unknown event status: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for EventStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct InboundEvent {
    /// Internal storage id, distinct from the provider's event id.
    pub id: Uuid,
    pub provider: Provider,
    /// Provider-assigned id, or `synthetic-<uuid>` when the provider sends
    /// none. Unique per provider.
    pub provider_event_id: String,
    pub event_type: String,
    /// Redacted payload, or an offload pointer for oversized payloads.
    pub payload: Value,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
    pub status: EventStatus,
    pub result: Option<String>,
    pub error: Option<String>,
    pub retry_count: i32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processing_started_at: Option<OffsetDateTime>,
}

impl InboundEvent {
    /// Blob key if the payload was offloaded.
    pub fn blob_key(&self) -> Option<&str> {
        if self.payload.get("offloaded").and_then(Value::as_bool) == Some(true) {
            self.payload.get("blob_key").and_then(Value::as_str)
        } else {
            None
        }
    }
}

/// Result of a store attempt: `created` is false when a row for the same
/// `(provider, provider_event_id)` already existed.
#[derive(Debug, Clone)]
pub struct StoredEvent {
    pub event: InboundEvent,
    pub created: bool,
}

#[derive(Debug, Clone)]
pub enum EventOutcome {
    Success { result: Option<String> },
    Failure { error: String },
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: Uuid,
    provider: String,
    provider_event_id: String,
    event_type: String,
    payload: String,
    received_at: OffsetDateTime,
    status: String,
    result: Option<String>,
    error: Option<String>,
    retry_count: i32,
    processing_started_at: Option<OffsetDateTime>,
}

impl TryFrom<EventRow> for InboundEvent {
    type Error = BillingError;

    fn try_from(row: EventRow) -> BillingResult<Self> {
        Ok(InboundEvent {
            id: row.id,
            provider: Provider::parse(&row.provider)?,
            provider_event_id: row.provider_event_id,
            event_type: row.event_type,
            payload: serde_json::from_str(&row.payload)
                .map_err(|e| BillingError::Database(format!("corrupt payload column: {}", e)))?,
            received_at: row.received_at,
            status: EventStatus::parse(&row.status)?,
            result: row.result,
            error: row.error,
            retry_count: row.retry_count,
            processing_started_at: row.processing_started_at,
        })
    }
}

const EVENT_COLUMNS: &str = "id, provider, provider_event_id, event_type, payload, \
     received_at, status, result, error, retry_count, processing_started_at";

#[derive(Clone)]
pub struct EventStore {
    backend: EventBackend,
    blobs: BlobStore,
}

#[derive(Clone)]
enum EventBackend {
    Postgres(PgPool),
    Memory(Arc<RwLock<HashMap<Uuid, InboundEvent>>>),
}

impl EventStore {
    pub fn new_postgres(pool: PgPool, blobs: BlobStore) -> Self {
        Self {
            backend: EventBackend::Postgres(pool),
            blobs,
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: EventBackend::Memory(Arc::new(RwLock::new(HashMap::new()))),
            blobs: BlobStore::new_in_memory(),
        }
    }

    /// Persist a verified delivery. Redacts the payload, offloads it when
    /// oversized, and dedups on `(provider, provider_event_id)`: a second
    /// store of the same event returns the existing row with `created:
    /// false` instead of inserting.
    pub async fn store(
        &self,
        provider: Provider,
        provider_event_id: Option<String>,
        raw_event_type: &str,
        mut payload: Value,
    ) -> BillingResult<StoredEvent> {
        let storage_id = Uuid::new_v4();
        let provider_event_id =
            provider_event_id.unwrap_or_else(|| format!("synthetic-{}", Uuid::new_v4()));
        let event_type = sanitize_event_type(raw_event_type);

        redact_payload(&mut payload);
        let serialized = serde_json::to_string(&payload)
            .map_err(|e| BillingError::InvalidInput(format!("unserializable payload: {}", e)))?;

        let stored_payload = if serialized.len() >= INLINE_PAYLOAD_LIMIT {
            let key = payload_key(provider, storage_id);
            self.blobs.put(&key, serialized.as_bytes()).await?;
            info!(
                provider = %provider,
                blob_key = %key,
                size_bytes = serialized.len(),
                "Offloaded oversized webhook payload"
            );
            json!({
                "offloaded": true,
                "blob_key": key,
                "size_bytes": serialized.len(),
            })
        } else {
            payload
        };

        let event = InboundEvent {
            id: storage_id,
            provider,
            provider_event_id,
            event_type,
            payload: stored_payload,
            received_at: OffsetDateTime::now_utc(),
            status: EventStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            processing_started_at: None,
        };

        match &self.backend {
            EventBackend::Postgres(pool) => {
                let inserted: Option<(Uuid,)> = sqlx::query_as(
                    "INSERT INTO webhook_events \
                     (id, provider, provider_event_id, event_type, payload, received_at, \
                      status, retry_count) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, 0) \
                     ON CONFLICT (provider, provider_event_id) DO NOTHING \
                     RETURNING id",
                )
                .bind(event.id)
                .bind(event.provider.as_str())
                .bind(&event.provider_event_id)
                .bind(&event.event_type)
                .bind(event.payload.to_string())
                .bind(event.received_at)
                .bind(event.status.as_str())
                .fetch_optional(pool)
                .await?;

                if inserted.is_some() {
                    Ok(StoredEvent {
                        event,
                        created: true,
                    })
                } else {
                    let existing = self
                        .find_by_provider_id(provider, &event.provider_event_id)
                        .await?
                        .ok_or_else(|| {
                            BillingError::Database(
                                "conflicting event row disappeared".to_string(),
                            )
                        })?;
                    Ok(StoredEvent {
                        event: existing,
                        created: false,
                    })
                }
            }
            EventBackend::Memory(map) => {
                let mut map = map.write().await;
                let existing = map
                    .values()
                    .find(|e| {
                        e.provider == provider && e.provider_event_id == event.provider_event_id
                    })
                    .cloned();
                if let Some(existing) = existing {
                    return Ok(StoredEvent {
                        event: existing,
                        created: false,
                    });
                }
                map.insert(event.id, event.clone());
                Ok(StoredEvent {
                    event,
                    created: true,
                })
            }
        }
    }

    pub async fn get(&self, storage_id: Uuid) -> BillingResult<Option<InboundEvent>> {
        match &self.backend {
            EventBackend::Postgres(pool) => {
                let row: Option<EventRow> = sqlx::query_as(&format!(
                    "SELECT {} FROM webhook_events WHERE id = $1",
                    EVENT_COLUMNS
                ))
                .bind(storage_id)
                .fetch_optional(pool)
                .await?;
                row.map(InboundEvent::try_from).transpose()
            }
            EventBackend::Memory(map) => Ok(map.read().await.get(&storage_id).cloned()),
        }
    }

    /// Persistent idempotency check, consulted when the ledger has expired
    /// or is unavailable.
    pub async fn find_by_provider_id(
        &self,
        provider: Provider,
        provider_event_id: &str,
    ) -> BillingResult<Option<InboundEvent>> {
        match &self.backend {
            EventBackend::Postgres(pool) => {
                let row: Option<EventRow> = sqlx::query_as(&format!(
                    "SELECT {} FROM webhook_events \
                     WHERE provider = $1 AND provider_event_id = $2",
                    EVENT_COLUMNS
                ))
                .bind(provider.as_str())
                .bind(provider_event_id)
                .fetch_optional(pool)
                .await?;
                row.map(InboundEvent::try_from).transpose()
            }
            EventBackend::Memory(map) => Ok(map
                .read()
                .await
                .values()
                .find(|e| e.provider == provider && e.provider_event_id == provider_event_id)
                .cloned()),
        }
    }

    /// The full payload for processing, following the offload pointer when
    /// the inline column only holds a reference.
    pub async fn load_payload(&self, event: &InboundEvent) -> BillingResult<Value> {
        match event.blob_key() {
            Some(key) => {
                let bytes = self.blobs.get(key).await?.ok_or_else(|| {
                    BillingError::NotFound(format!("offloaded payload missing: {}", key))
                })?;
                serde_json::from_slice(&bytes).map_err(|e| {
                    BillingError::Database(format!("corrupt offloaded payload {}: {}", key, e))
                })
            }
            None => Ok(event.payload.clone()),
        }
    }

    pub async fn mark_processing(&self, storage_id: Uuid) -> BillingResult<()> {
        let now = OffsetDateTime::now_utc();
        match &self.backend {
            EventBackend::Postgres(pool) => {
                sqlx::query(
                    "UPDATE webhook_events \
                     SET status = 'processing', processing_started_at = $2 \
                     WHERE id = $1",
                )
                .bind(storage_id)
                .bind(now)
                .execute(pool)
                .await?;
                Ok(())
            }
            EventBackend::Memory(map) => {
                let mut map = map.write().await;
                let event = map
                    .get_mut(&storage_id)
                    .ok_or_else(|| BillingError::NotFound(format!("event {}", storage_id)))?;
                event.status = EventStatus::Processing;
                event.processing_started_at = Some(now);
                Ok(())
            }
        }
    }

    pub async fn mark_outcome(
        &self,
        storage_id: Uuid,
        outcome: &EventOutcome,
    ) -> BillingResult<()> {
        let (status, result, error) = match outcome {
            EventOutcome::Success { result } => (
                EventStatus::Processed,
                result.as_deref().map(truncate_error),
                None,
            ),
            EventOutcome::Failure { error } => {
                (EventStatus::Failed, None, Some(truncate_error(error)))
            }
        };
        match &self.backend {
            EventBackend::Postgres(pool) => {
                sqlx::query(
                    "UPDATE webhook_events \
                     SET status = $2, result = $3, error = $4 \
                     WHERE id = $1",
                )
                .bind(storage_id)
                .bind(status.as_str())
                .bind(&result)
                .bind(&error)
                .execute(pool)
                .await?;
                Ok(())
            }
            EventBackend::Memory(map) => {
                let mut map = map.write().await;
                let event = map
                    .get_mut(&storage_id)
                    .ok_or_else(|| BillingError::NotFound(format!("event {}", storage_id)))?;
                event.status = status;
                event.result = result;
                event.error = error;
                Ok(())
            }
        }
    }

    /// Atomically claim an event for replay: bump the retry counter and flip
    /// to `processing`, but only if it is still replayable. Returns the
    /// claimed event, or `None` when another worker got there first or the
    /// event left the replayable states.
    pub async fn claim_for_replay(
        &self,
        storage_id: Uuid,
        max_retries: i32,
    ) -> BillingResult<Option<InboundEvent>> {
        let now = OffsetDateTime::now_utc();
        match &self.backend {
            EventBackend::Postgres(pool) => {
                let row: Option<EventRow> = sqlx::query_as(&format!(
                    "UPDATE webhook_events \
                     SET status = 'processing', retry_count = retry_count + 1, \
                         processing_started_at = $3, error = NULL \
                     WHERE id = $1 \
                       AND status IN ('failed', 'pending') \
                       AND retry_count < $2 \
                     RETURNING {}",
                    EVENT_COLUMNS
                ))
                .bind(storage_id)
                .bind(max_retries)
                .bind(now)
                .fetch_optional(pool)
                .await?;
                row.map(InboundEvent::try_from).transpose()
            }
            EventBackend::Memory(map) => {
                let mut map = map.write().await;
                let Some(event) = map.get_mut(&storage_id) else {
                    return Ok(None);
                };
                let replayable = matches!(event.status, EventStatus::Failed | EventStatus::Pending)
                    && event.retry_count < max_retries;
                if !replayable {
                    return Ok(None);
                }
                event.status = EventStatus::Processing;
                event.retry_count += 1;
                event.processing_started_at = Some(now);
                event.error = None;
                Ok(Some(event.clone()))
            }
        }
    }

    /// Recent events for the admin surface, newest first, optionally
    /// filtered by status.
    pub async fn list(
        &self,
        status: Option<EventStatus>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<InboundEvent>> {
        match &self.backend {
            EventBackend::Postgres(pool) => {
                let rows: Vec<EventRow> = match status {
                    Some(status) => {
                        sqlx::query_as(&format!(
                            "SELECT {} FROM webhook_events WHERE status = $1 \
                             ORDER BY received_at DESC LIMIT $2 OFFSET $3",
                            EVENT_COLUMNS
                        ))
                        .bind(status.as_str())
                        .bind(limit)
                        .bind(offset)
                        .fetch_all(pool)
                        .await?
                    }
                    None => {
                        sqlx::query_as(&format!(
                            "SELECT {} FROM webhook_events \
                             ORDER BY received_at DESC LIMIT $1 OFFSET $2",
                            EVENT_COLUMNS
                        ))
                        .bind(limit)
                        .bind(offset)
                        .fetch_all(pool)
                        .await?
                    }
                };
                rows.into_iter().map(InboundEvent::try_from).collect()
            }
            EventBackend::Memory(map) => {
                let map = map.read().await;
                let mut events: Vec<InboundEvent> = map
                    .values()
                    .filter(|e| status.is_none_or(|s| e.status == s))
                    .cloned()
                    .collect();
                events.sort_by(|a, b| b.received_at.cmp(&a.received_at));
                Ok(events
                    .into_iter()
                    .skip(offset as usize)
                    .take(limit as usize)
                    .collect())
            }
        }
    }

    /// Storage ids of failed events that have retries left, oldest first.
    pub async fn failed_event_ids(
        &self,
        max_retries: i32,
        limit: i64,
    ) -> BillingResult<Vec<Uuid>> {
        match &self.backend {
            EventBackend::Postgres(pool) => {
                let rows: Vec<(Uuid,)> = sqlx::query_as(
                    "SELECT id FROM webhook_events \
                     WHERE status = 'failed' AND retry_count < $1 \
                     ORDER BY received_at ASC LIMIT $2",
                )
                .bind(max_retries)
                .bind(limit)
                .fetch_all(pool)
                .await?;
                Ok(rows.into_iter().map(|(id,)| id).collect())
            }
            EventBackend::Memory(map) => {
                let map = map.read().await;
                let mut failed: Vec<&InboundEvent> = map
                    .values()
                    .filter(|e| e.status == EventStatus::Failed && e.retry_count < max_retries)
                    .collect();
                failed.sort_by_key(|e| e.received_at);
                Ok(failed.into_iter().take(limit as usize).map(|e| e.id).collect())
            }
        }
    }

    /// Flip events stuck in `processing` past the timeout back to `failed`
    /// so they become replayable again. Returns how many were recovered.
    pub async fn recover_stuck(&self, older_than_minutes: i64) -> BillingResult<u64> {
        let cutoff = OffsetDateTime::now_utc() - time::Duration::minutes(older_than_minutes);
        let recovered = match &self.backend {
            EventBackend::Postgres(pool) => {
                let result = sqlx::query(
                    "UPDATE webhook_events \
                     SET status = 'failed', error = 'processing timed out' \
                     WHERE status = 'processing' AND processing_started_at < $1",
                )
                .bind(cutoff)
                .execute(pool)
                .await?;
                result.rows_affected()
            }
            EventBackend::Memory(map) => {
                let mut map = map.write().await;
                let mut count = 0u64;
                for event in map.values_mut() {
                    let stuck = event.status == EventStatus::Processing
                        && event.processing_started_at.is_some_and(|t| t < cutoff);
                    if stuck {
                        event.status = EventStatus::Failed;
                        event.error = Some("processing timed out".to_string());
                        count += 1;
                    }
                }
                count
            }
        };
        if recovered > 0 {
            info!(recovered, "Recovered webhook events stuck in processing");
        }
        Ok(recovered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_payload() -> Value {
        json!({ "id": "evt_1", "type": "invoice.paid", "data": { "object": {} } })
    }

    #[tokio::test]
    async fn test_store_assigns_storage_id_and_pending_status() {
        let store = EventStore::new_in_memory();
        let stored = store
            .store(
                Provider::Stripe,
                Some("evt_1".to_string()),
                "invoice.paid",
                small_payload(),
            )
            .await
            .unwrap();
        assert!(stored.created);
        assert_eq!(stored.event.status, EventStatus::Pending);
        assert_eq!(stored.event.provider_event_id, "evt_1");
        assert_eq!(stored.event.retry_count, 0);
    }

    #[tokio::test]
    async fn test_duplicate_store_returns_existing_row() {
        let store = EventStore::new_in_memory();
        let first = store
            .store(
                Provider::Stripe,
                Some("evt_1".to_string()),
                "invoice.paid",
                small_payload(),
            )
            .await
            .unwrap();
        let second = store
            .store(
                Provider::Stripe,
                Some("evt_1".to_string()),
                "invoice.paid",
                small_payload(),
            )
            .await
            .unwrap();
        assert!(!second.created);
        assert_eq!(second.event.id, first.event.id);
    }

    #[tokio::test]
    async fn test_missing_provider_id_gets_synthetic_id() {
        let store = EventStore::new_in_memory();
        let a = store
            .store(Provider::Slack, None, "app_mention", small_payload())
            .await
            .unwrap();
        let b = store
            .store(Provider::Slack, None, "app_mention", small_payload())
            .await
            .unwrap();
        assert!(a.event.provider_event_id.starts_with("synthetic-"));
        // Synthetic ids never collide, so both deliveries are stored.
        assert!(a.created && b.created);
        assert_ne!(a.event.provider_event_id, b.event.provider_event_id);
    }

    #[tokio::test]
    async fn test_payload_redacted_before_storage() {
        let store = EventStore::new_in_memory();
        let payload = json!({
            "id": "evt_1",
            "data": { "object": { "card_number": "4242424242424242", "amount": 500 } },
        });
        let stored = store
            .store(Provider::Stripe, Some("evt_1".to_string()), "charge.created", payload)
            .await
            .unwrap();
        assert_eq!(
            stored.event.payload["data"]["object"]["card_number"],
            crate::redact::REDACTED_MARKER
        );
        assert_eq!(stored.event.payload["data"]["object"]["amount"], 500);
    }

    #[tokio::test]
    async fn test_oversized_payload_offloaded_and_loadable() {
        let store = EventStore::new_in_memory();
        let big = "x".repeat(INLINE_PAYLOAD_LIMIT);
        let payload = json!({ "id": "evt_big", "blob": big });
        let stored = store
            .store(
                Provider::Github,
                Some("evt_big".to_string()),
                "push",
                payload.clone(),
            )
            .await
            .unwrap();

        let key = stored.event.blob_key().expect("payload should be offloaded");
        assert!(key.starts_with("webhooks/github/"));
        assert_eq!(
            stored.event.payload["size_bytes"].as_u64().unwrap() as usize,
            payload.to_string().len()
        );

        let loaded = store.load_payload(&stored.event).await.unwrap();
        assert_eq!(loaded, payload);
    }

    #[tokio::test]
    async fn test_small_payload_stays_inline() {
        let store = EventStore::new_in_memory();
        let stored = store
            .store(
                Provider::Stripe,
                Some("evt_1".to_string()),
                "invoice.paid",
                small_payload(),
            )
            .await
            .unwrap();
        assert!(stored.event.blob_key().is_none());
        let loaded = store.load_payload(&stored.event).await.unwrap();
        assert_eq!(loaded, stored.event.payload);
    }

    #[tokio::test]
    async fn test_event_type_sanitized() {
        let store = EventStore::new_in_memory();
        let stored = store
            .store(
                Provider::Stripe,
                Some("evt_1".to_string()),
                "<img src=x>invoice.paid",
                small_payload(),
            )
            .await
            .unwrap();
        assert_eq!(stored.event.event_type, "imgsrcxinvoice.paid");
    }

    #[tokio::test]
    async fn test_status_transitions() {
        let store = EventStore::new_in_memory();
        let stored = store
            .store(
                Provider::Stripe,
                Some("evt_1".to_string()),
                "invoice.paid",
                small_payload(),
            )
            .await
            .unwrap();
        let id = stored.event.id;

        store.mark_processing(id).await.unwrap();
        assert_eq!(
            store.get(id).await.unwrap().unwrap().status,
            EventStatus::Processing
        );

        store
            .mark_outcome(
                id,
                &EventOutcome::Success {
                    result: Some("applied".to_string()),
                },
            )
            .await
            .unwrap();
        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Processed);
        assert_eq!(event.result.as_deref(), Some("applied"));
        assert!(event.error.is_none());
    }

    #[tokio::test]
    async fn test_failure_outcome_truncates_error() {
        let store = EventStore::new_in_memory();
        let stored = store
            .store(
                Provider::Stripe,
                Some("evt_1".to_string()),
                "invoice.paid",
                small_payload(),
            )
            .await
            .unwrap();
        store
            .mark_outcome(
                stored.event.id,
                &EventOutcome::Failure {
                    error: "e".repeat(2000),
                },
            )
            .await
            .unwrap();
        let event = store.get(stored.event.id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        assert!(event.error.unwrap().chars().count() <= 513);
    }

    #[tokio::test]
    async fn test_claim_for_replay_respects_state_and_ceiling() {
        let store = EventStore::new_in_memory();
        let stored = store
            .store(
                Provider::Stripe,
                Some("evt_1".to_string()),
                "invoice.paid",
                small_payload(),
            )
            .await
            .unwrap();
        let id = stored.event.id;
        store
            .mark_outcome(
                id,
                &EventOutcome::Failure {
                    error: "boom".to_string(),
                },
            )
            .await
            .unwrap();

        let claimed = store.claim_for_replay(id, 5).await.unwrap().unwrap();
        assert_eq!(claimed.retry_count, 1);
        assert_eq!(claimed.status, EventStatus::Processing);

        // Still processing, not claimable again.
        assert!(store.claim_for_replay(id, 5).await.unwrap().is_none());

        // Exhaust the ceiling.
        for _ in 0..4 {
            store
                .mark_outcome(
                    id,
                    &EventOutcome::Failure {
                        error: "boom".to_string(),
                    },
                )
                .await
                .unwrap();
            store.claim_for_replay(id, 5).await.unwrap();
        }
        store
            .mark_outcome(
                id,
                &EventOutcome::Failure {
                    error: "boom".to_string(),
                },
            )
            .await
            .unwrap();
        assert_eq!(store.get(id).await.unwrap().unwrap().retry_count, 5);
        assert!(store.claim_for_replay(id, 5).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_list_filters_by_status() {
        let store = EventStore::new_in_memory();
        let a = store
            .store(Provider::Stripe, Some("evt_a".to_string()), "t", small_payload())
            .await
            .unwrap();
        store
            .store(Provider::Stripe, Some("evt_b".to_string()), "t", small_payload())
            .await
            .unwrap();
        store
            .mark_outcome(
                a.event.id,
                &EventOutcome::Failure {
                    error: "boom".to_string(),
                },
            )
            .await
            .unwrap();

        let failed = store
            .list(Some(EventStatus::Failed), 10, 0)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].id, a.event.id);

        let all = store.list(None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_recover_stuck_flips_old_processing_events() {
        let store = EventStore::new_in_memory();
        let stored = store
            .store(
                Provider::Stripe,
                Some("evt_1".to_string()),
                "invoice.paid",
                small_payload(),
            )
            .await
            .unwrap();
        let id = stored.event.id;
        store.mark_processing(id).await.unwrap();

        // Fresh processing events are untouched.
        assert_eq!(store.recover_stuck(30).await.unwrap(), 0);

        // Backdate the processing start past the cutoff.
        if let EventBackend::Memory(map) = &store.backend {
            let mut map = map.write().await;
            let event = map.get_mut(&id).unwrap();
            event.processing_started_at =
                Some(OffsetDateTime::now_utc() - time::Duration::minutes(45));
        }

        assert_eq!(store.recover_stuck(30).await.unwrap(), 1);
        let event = store.get(id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Failed);
        assert_eq!(event.error.as_deref(), Some("processing timed out"));
    }
}
