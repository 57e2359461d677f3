//! Subscription state machine and store
//!
//! Applies provider lifecycle events to the tenant's subscription record.
//! Events arrive in a provider-style envelope (`{"id", "type", "data":
//! {"object": ...}}`); the tenant is resolved from `metadata.tenant_id` on
//! the object, falling back to a customer-id lookup against previously
//! stored subscriptions.
//!
//! Handlers are written to be idempotent: re-applying an event converges on
//! the same record, which is what makes replay safe.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entitlements::EntitlementResolver;
use crate::error::{BillingError, BillingResult};
use crate::events::InboundEvent;
use crate::notify::{Notifier, OutboundNotification};
use crate::providers::Provider;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    Active,
    Trialing,
    PastDue,
    Unpaid,
    Canceled,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Trialing => "trialing",
            SubscriptionStatus::PastDue => "past_due",
            SubscriptionStatus::Unpaid => "unpaid",
            SubscriptionStatus::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> BillingResult<Self> {
        match s {
            "active" => Ok(SubscriptionStatus::Active),
            "trialing" => Ok(SubscriptionStatus::Trialing),
            "past_due" => Ok(SubscriptionStatus::PastDue),
            "unpaid" => Ok(SubscriptionStatus::Unpaid),
            "canceled" | "cancelled" => Ok(SubscriptionStatus::Canceled),
            other => Err(BillingError::InvalidInput(format!(
                "unknown subscription status: {}",
                other
            ))),
        }
    }

    /// Statuses that grant paid entitlements. `past_due` keeps the paid plan
    /// until the dunning window hard-downgrades it.
    pub fn grants_paid_plan(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Active | SubscriptionStatus::Trialing | SubscriptionStatus::PastDue
        )
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct Subscription {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider: Provider,
    pub provider_subscription_id: String,
    pub provider_customer_id: String,
    pub status: SubscriptionStatus,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_start: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// First unresolved payment failure. Sticky: later failures never move
    /// it, only a successful payment clears it.
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_payment_failed_at: Option<OffsetDateTime>,
    /// Highest dunning stage reached for the current failure window, 0-4.
    pub last_dunning_stage: i16,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_reminder_at: Option<OffsetDateTime>,
    /// Set once the subscription is terminally ended. At most one record per
    /// tenant has this unset.
    #[serde(with = "time::serde::rfc3339::option")]
    pub ended_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn is_current(&self) -> bool {
        self.ended_at.is_none()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct InvoiceRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider: Provider,
    pub provider_invoice_id: String,
    pub provider_subscription_id: Option<String>,
    pub amount_cents: i64,
    /// `paid` or `payment_failed`.
    pub status: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub paid_at: Option<OffsetDateTime>,
}

#[derive(sqlx::FromRow)]
struct SubscriptionRow {
    id: Uuid,
    tenant_id: Uuid,
    provider: String,
    provider_subscription_id: String,
    provider_customer_id: String,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    last_payment_failed_at: Option<OffsetDateTime>,
    last_dunning_stage: i16,
    last_reminder_at: Option<OffsetDateTime>,
    ended_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl TryFrom<SubscriptionRow> for Subscription {
    type Error = BillingError;

    fn try_from(row: SubscriptionRow) -> BillingResult<Self> {
        Ok(Subscription {
            id: row.id,
            tenant_id: row.tenant_id,
            provider: Provider::parse(&row.provider)?,
            provider_subscription_id: row.provider_subscription_id,
            provider_customer_id: row.provider_customer_id,
            status: SubscriptionStatus::parse(&row.status)?,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            cancel_at_period_end: row.cancel_at_period_end,
            last_payment_failed_at: row.last_payment_failed_at,
            last_dunning_stage: row.last_dunning_stage,
            last_reminder_at: row.last_reminder_at,
            ended_at: row.ended_at,
            updated_at: row.updated_at,
        })
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, tenant_id, provider, provider_subscription_id, \
     provider_customer_id, status, current_period_start, current_period_end, \
     cancel_at_period_end, last_payment_failed_at, last_dunning_stage, \
     last_reminder_at, ended_at, updated_at";

/// Fields written by a checkout or subscription update, taken from the
/// provider's authoritative subscription object.
#[derive(Debug, Clone)]
pub struct SubscriptionWrite {
    pub provider_subscription_id: String,
    pub provider_customer_id: String,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

#[derive(Default)]
struct MemoryState {
    subscriptions: Vec<Subscription>,
    invoices: Vec<InvoiceRecord>,
}

#[derive(Clone)]
pub struct SubscriptionStore {
    backend: SubscriptionBackend,
}

#[derive(Clone)]
enum SubscriptionBackend {
    Postgres(PgPool),
    Memory(Arc<Mutex<MemoryState>>),
}

impl SubscriptionStore {
    pub fn new_postgres(pool: PgPool) -> Self {
        Self {
            backend: SubscriptionBackend::Postgres(pool),
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: SubscriptionBackend::Memory(Arc::new(Mutex::new(MemoryState::default()))),
        }
    }

    /// The tenant's current (non-ended) subscription.
    pub async fn get_current(&self, tenant_id: Uuid) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
                    "SELECT {} FROM subscriptions \
                     WHERE tenant_id = $1 AND ended_at IS NULL",
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(tenant_id)
                .fetch_optional(pool)
                .await?;
                row.map(Subscription::try_from).transpose()
            }
            SubscriptionBackend::Memory(state) => Ok(state
                .lock()
                .await
                .subscriptions
                .iter()
                .find(|s| s.tenant_id == tenant_id && s.is_current())
                .cloned()),
        }
    }

    pub async fn find_by_provider_subscription(
        &self,
        provider: Provider,
        provider_subscription_id: &str,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
                    "SELECT {} FROM subscriptions \
                     WHERE provider = $1 AND provider_subscription_id = $2 AND ended_at IS NULL",
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(provider.as_str())
                .bind(provider_subscription_id)
                .fetch_optional(pool)
                .await?;
                row.map(Subscription::try_from).transpose()
            }
            SubscriptionBackend::Memory(state) => Ok(state
                .lock()
                .await
                .subscriptions
                .iter()
                .find(|s| {
                    s.provider == provider
                        && s.provider_subscription_id == provider_subscription_id
                        && s.is_current()
                })
                .cloned()),
        }
    }

    /// Tenant lookup by provider customer id, used when an event carries no
    /// tenant metadata.
    pub async fn find_tenant_by_customer(
        &self,
        provider: Provider,
        provider_customer_id: &str,
    ) -> BillingResult<Option<Uuid>> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                let row: Option<(Uuid,)> = sqlx::query_as(
                    "SELECT tenant_id FROM subscriptions \
                     WHERE provider = $1 AND provider_customer_id = $2 \
                     ORDER BY updated_at DESC LIMIT 1",
                )
                .bind(provider.as_str())
                .bind(provider_customer_id)
                .fetch_optional(pool)
                .await?;
                Ok(row.map(|(id,)| id))
            }
            SubscriptionBackend::Memory(state) => Ok(state
                .lock()
                .await
                .subscriptions
                .iter()
                .filter(|s| {
                    s.provider == provider && s.provider_customer_id == provider_customer_id
                })
                .max_by_key(|s| s.updated_at)
                .map(|s| s.tenant_id)),
        }
    }

    /// Activate the tenant's subscription from a completed checkout. Updates
    /// the current record in place if one exists, otherwise creates one; the
    /// conditional write keeps the one-current-record-per-tenant invariant
    /// under concurrent deliveries.
    pub async fn upsert_checkout(
        &self,
        tenant_id: Uuid,
        provider: Provider,
        write: &SubscriptionWrite,
        now: OffsetDateTime,
    ) -> BillingResult<Subscription> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                let row: SubscriptionRow = sqlx::query_as(&format!(
                    "INSERT INTO subscriptions \
                     (id, tenant_id, provider, provider_subscription_id, provider_customer_id, \
                      status, current_period_start, current_period_end, cancel_at_period_end, \
                      last_payment_failed_at, last_dunning_stage, last_reminder_at, ended_at, \
                      created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NULL, 0, NULL, NULL, $10, $10) \
                     ON CONFLICT (tenant_id) WHERE ended_at IS NULL DO UPDATE SET \
                       provider_subscription_id = EXCLUDED.provider_subscription_id, \
                       provider_customer_id = EXCLUDED.provider_customer_id, \
                       status = EXCLUDED.status, \
                       current_period_start = EXCLUDED.current_period_start, \
                       current_period_end = EXCLUDED.current_period_end, \
                       cancel_at_period_end = EXCLUDED.cancel_at_period_end, \
                       last_payment_failed_at = NULL, \
                       last_dunning_stage = 0, \
                       last_reminder_at = NULL, \
                       updated_at = EXCLUDED.updated_at \
                     RETURNING {}",
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(Uuid::new_v4())
                .bind(tenant_id)
                .bind(provider.as_str())
                .bind(&write.provider_subscription_id)
                .bind(&write.provider_customer_id)
                .bind(write.status.as_str())
                .bind(write.current_period_start)
                .bind(write.current_period_end)
                .bind(write.cancel_at_period_end)
                .bind(now)
                .fetch_one(pool)
                .await?;
                Subscription::try_from(row)
            }
            SubscriptionBackend::Memory(state) => {
                let mut state = state.lock().await;
                if let Some(existing) = state
                    .subscriptions
                    .iter_mut()
                    .find(|s| s.tenant_id == tenant_id && s.is_current())
                {
                    existing.provider_subscription_id = write.provider_subscription_id.clone();
                    existing.provider_customer_id = write.provider_customer_id.clone();
                    existing.status = write.status;
                    existing.current_period_start = write.current_period_start;
                    existing.current_period_end = write.current_period_end;
                    existing.cancel_at_period_end = write.cancel_at_period_end;
                    existing.last_payment_failed_at = None;
                    existing.last_dunning_stage = 0;
                    existing.last_reminder_at = None;
                    existing.updated_at = now;
                    return Ok(existing.clone());
                }
                let subscription = Subscription {
                    id: Uuid::new_v4(),
                    tenant_id,
                    provider,
                    provider_subscription_id: write.provider_subscription_id.clone(),
                    provider_customer_id: write.provider_customer_id.clone(),
                    status: write.status,
                    current_period_start: write.current_period_start,
                    current_period_end: write.current_period_end,
                    cancel_at_period_end: write.cancel_at_period_end,
                    last_payment_failed_at: None,
                    last_dunning_stage: 0,
                    last_reminder_at: None,
                    ended_at: None,
                    updated_at: now,
                };
                state.subscriptions.push(subscription.clone());
                Ok(subscription)
            }
        }
    }

    /// Apply a provider-side subscription change to the current record.
    pub async fn apply_update(
        &self,
        provider: Provider,
        write: &SubscriptionWrite,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
                    "UPDATE subscriptions SET \
                       status = $3, \
                       current_period_start = $4, \
                       current_period_end = $5, \
                       cancel_at_period_end = $6, \
                       updated_at = $7 \
                     WHERE provider = $1 AND provider_subscription_id = $2 \
                       AND ended_at IS NULL \
                     RETURNING {}",
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(provider.as_str())
                .bind(&write.provider_subscription_id)
                .bind(write.status.as_str())
                .bind(write.current_period_start)
                .bind(write.current_period_end)
                .bind(write.cancel_at_period_end)
                .bind(now)
                .fetch_optional(pool)
                .await?;
                row.map(Subscription::try_from).transpose()
            }
            SubscriptionBackend::Memory(state) => {
                let mut state = state.lock().await;
                let Some(existing) = state.subscriptions.iter_mut().find(|s| {
                    s.provider == provider
                        && s.provider_subscription_id == write.provider_subscription_id
                        && s.is_current()
                }) else {
                    return Ok(None);
                };
                existing.status = write.status;
                existing.current_period_start = write.current_period_start;
                existing.current_period_end = write.current_period_end;
                existing.cancel_at_period_end = write.cancel_at_period_end;
                existing.updated_at = now;
                Ok(Some(existing.clone()))
            }
        }
    }

    /// Terminally end a subscription. Idempotent: already-ended records are
    /// left untouched and `None` is returned.
    pub async fn end_subscription(
        &self,
        provider: Provider,
        provider_subscription_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
                    "UPDATE subscriptions \
                     SET status = 'canceled', ended_at = $3, updated_at = $3 \
                     WHERE provider = $1 AND provider_subscription_id = $2 \
                       AND ended_at IS NULL \
                     RETURNING {}",
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(provider.as_str())
                .bind(provider_subscription_id)
                .bind(now)
                .fetch_optional(pool)
                .await?;
                row.map(Subscription::try_from).transpose()
            }
            SubscriptionBackend::Memory(state) => {
                let mut state = state.lock().await;
                let Some(existing) = state.subscriptions.iter_mut().find(|s| {
                    s.provider == provider
                        && s.provider_subscription_id == provider_subscription_id
                        && s.is_current()
                }) else {
                    return Ok(None);
                };
                existing.status = SubscriptionStatus::Canceled;
                existing.ended_at = Some(now);
                existing.updated_at = now;
                Ok(Some(existing.clone()))
            }
        }
    }

    /// Successful payment: restore `active` and clear the whole dunning
    /// window.
    pub async fn mark_invoice_paid(
        &self,
        provider: Provider,
        provider_subscription_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
                    "UPDATE subscriptions SET \
                       status = 'active', \
                       last_payment_failed_at = NULL, \
                       last_dunning_stage = 0, \
                       last_reminder_at = NULL, \
                       updated_at = $3 \
                     WHERE provider = $1 AND provider_subscription_id = $2 \
                       AND ended_at IS NULL \
                     RETURNING {}",
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(provider.as_str())
                .bind(provider_subscription_id)
                .bind(now)
                .fetch_optional(pool)
                .await?;
                row.map(Subscription::try_from).transpose()
            }
            SubscriptionBackend::Memory(state) => {
                let mut state = state.lock().await;
                let Some(existing) = state.subscriptions.iter_mut().find(|s| {
                    s.provider == provider
                        && s.provider_subscription_id == provider_subscription_id
                        && s.is_current()
                }) else {
                    return Ok(None);
                };
                existing.status = SubscriptionStatus::Active;
                existing.last_payment_failed_at = None;
                existing.last_dunning_stage = 0;
                existing.last_reminder_at = None;
                existing.updated_at = now;
                Ok(Some(existing.clone()))
            }
        }
    }

    /// Failed payment: flip to `past_due` and open the dunning window. The
    /// COALESCE keeps the original failure timestamp when later failures
    /// arrive in the same window.
    pub async fn mark_payment_failed(
        &self,
        provider: Provider,
        provider_subscription_id: &str,
        now: OffsetDateTime,
    ) -> BillingResult<Option<Subscription>> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                let row: Option<SubscriptionRow> = sqlx::query_as(&format!(
                    "UPDATE subscriptions SET \
                       status = 'past_due', \
                       last_payment_failed_at = COALESCE(last_payment_failed_at, $3), \
                       updated_at = $3 \
                     WHERE provider = $1 AND provider_subscription_id = $2 \
                       AND ended_at IS NULL \
                     RETURNING {}",
                    SUBSCRIPTION_COLUMNS
                ))
                .bind(provider.as_str())
                .bind(provider_subscription_id)
                .bind(now)
                .fetch_optional(pool)
                .await?;
                row.map(Subscription::try_from).transpose()
            }
            SubscriptionBackend::Memory(state) => {
                let mut state = state.lock().await;
                let Some(existing) = state.subscriptions.iter_mut().find(|s| {
                    s.provider == provider
                        && s.provider_subscription_id == provider_subscription_id
                        && s.is_current()
                }) else {
                    return Ok(None);
                };
                existing.status = SubscriptionStatus::PastDue;
                existing.last_payment_failed_at = existing.last_payment_failed_at.or(Some(now));
                existing.updated_at = now;
                Ok(Some(existing.clone()))
            }
        }
    }

    /// Record that a dunning stage was reached. The strictly-greater guard
    /// makes stage advancement monotonic under concurrent sweeps: the write
    /// wins at most once per stage.
    pub async fn advance_dunning_stage(
        &self,
        subscription_id: Uuid,
        to_stage: i16,
        now: OffsetDateTime,
    ) -> BillingResult<bool> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                let result = sqlx::query(
                    "UPDATE subscriptions \
                     SET last_dunning_stage = $2, last_reminder_at = $3, updated_at = $3 \
                     WHERE id = $1 AND last_dunning_stage < $2 AND ended_at IS NULL",
                )
                .bind(subscription_id)
                .bind(to_stage)
                .bind(now)
                .execute(pool)
                .await?;
                Ok(result.rows_affected() > 0)
            }
            SubscriptionBackend::Memory(state) => {
                let mut state = state.lock().await;
                let Some(existing) = state
                    .subscriptions
                    .iter_mut()
                    .find(|s| s.id == subscription_id && s.is_current())
                else {
                    return Ok(false);
                };
                if existing.last_dunning_stage >= to_stage {
                    return Ok(false);
                }
                existing.last_dunning_stage = to_stage;
                existing.last_reminder_at = Some(now);
                existing.updated_at = now;
                Ok(true)
            }
        }
    }

    /// Current `past_due` subscriptions with an open payment-failure window,
    /// for the dunning sweep. The status filter matters: a subscription the
    /// provider has since reported active may still carry a failure
    /// timestamp, and the sweep must not remind or downgrade it.
    pub async fn list_past_due(&self) -> BillingResult<Vec<Subscription>> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                let rows: Vec<SubscriptionRow> = sqlx::query_as(&format!(
                    "SELECT {} FROM subscriptions \
                     WHERE status = 'past_due' \
                       AND last_payment_failed_at IS NOT NULL AND ended_at IS NULL \
                     ORDER BY last_payment_failed_at ASC",
                    SUBSCRIPTION_COLUMNS
                ))
                .fetch_all(pool)
                .await?;
                rows.into_iter().map(Subscription::try_from).collect()
            }
            SubscriptionBackend::Memory(state) => {
                let state = state.lock().await;
                let mut subs: Vec<Subscription> = state
                    .subscriptions
                    .iter()
                    .filter(|s| {
                        s.status == SubscriptionStatus::PastDue
                            && s.last_payment_failed_at.is_some()
                            && s.is_current()
                    })
                    .cloned()
                    .collect();
                subs.sort_by_key(|s| s.last_payment_failed_at);
                Ok(subs)
            }
        }
    }

    /// Upsert an invoice record keyed by `(provider, provider_invoice_id)`.
    pub async fn upsert_invoice(&self, invoice: InvoiceRecord) -> BillingResult<()> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                sqlx::query(
                    "INSERT INTO invoices \
                     (id, tenant_id, provider, provider_invoice_id, provider_subscription_id, \
                      amount_cents, status, paid_at, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW()) \
                     ON CONFLICT (provider, provider_invoice_id) DO UPDATE SET \
                       status = EXCLUDED.status, \
                       paid_at = EXCLUDED.paid_at, \
                       amount_cents = EXCLUDED.amount_cents",
                )
                .bind(invoice.id)
                .bind(invoice.tenant_id)
                .bind(invoice.provider.as_str())
                .bind(&invoice.provider_invoice_id)
                .bind(&invoice.provider_subscription_id)
                .bind(invoice.amount_cents)
                .bind(&invoice.status)
                .bind(invoice.paid_at)
                .execute(pool)
                .await?;
                Ok(())
            }
            SubscriptionBackend::Memory(state) => {
                let mut state = state.lock().await;
                if let Some(existing) = state.invoices.iter_mut().find(|i| {
                    i.provider == invoice.provider
                        && i.provider_invoice_id == invoice.provider_invoice_id
                }) {
                    existing.status = invoice.status;
                    existing.paid_at = invoice.paid_at;
                    existing.amount_cents = invoice.amount_cents;
                } else {
                    state.invoices.push(invoice);
                }
                Ok(())
            }
        }
    }

    pub async fn find_invoice(
        &self,
        provider: Provider,
        provider_invoice_id: &str,
    ) -> BillingResult<Option<InvoiceRecord>> {
        match &self.backend {
            SubscriptionBackend::Postgres(pool) => {
                let row: Option<InvoiceRow> = sqlx::query_as(
                    "SELECT id, tenant_id, provider, provider_invoice_id, \
                            provider_subscription_id, amount_cents, status, paid_at \
                     FROM invoices WHERE provider = $1 AND provider_invoice_id = $2",
                )
                .bind(provider.as_str())
                .bind(provider_invoice_id)
                .fetch_optional(pool)
                .await?;
                row.map(InvoiceRecord::try_from).transpose()
            }
            SubscriptionBackend::Memory(state) => Ok(state
                .lock()
                .await
                .invoices
                .iter()
                .find(|i| i.provider == provider && i.provider_invoice_id == provider_invoice_id)
                .cloned()),
        }
    }
}

#[derive(sqlx::FromRow)]
struct InvoiceRow {
    id: Uuid,
    tenant_id: Uuid,
    provider: String,
    provider_invoice_id: String,
    provider_subscription_id: Option<String>,
    amount_cents: i64,
    status: String,
    paid_at: Option<OffsetDateTime>,
}

impl TryFrom<InvoiceRow> for InvoiceRecord {
    type Error = BillingError;

    fn try_from(row: InvoiceRow) -> BillingResult<Self> {
        Ok(InvoiceRecord {
            id: row.id,
            tenant_id: row.tenant_id,
            provider: Provider::parse(&row.provider)?,
            provider_invoice_id: row.provider_invoice_id,
            provider_subscription_id: row.provider_subscription_id,
            amount_cents: row.amount_cents,
            status: row.status,
            paid_at: row.paid_at,
        })
    }
}

// ---------------------------------------------------------------------------
// Payload shapes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SubscriptionObject {
    id: String,
    customer: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    current_period_start: Option<i64>,
    #[serde(default)]
    current_period_end: Option<i64>,
    #[serde(default)]
    cancel_at_period_end: bool,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

impl SubscriptionObject {
    fn write(&self) -> BillingResult<SubscriptionWrite> {
        let status = match self.status.as_deref() {
            Some(s) => SubscriptionStatus::parse(s)?,
            None => SubscriptionStatus::Active,
        };
        Ok(SubscriptionWrite {
            provider_subscription_id: self.id.clone(),
            provider_customer_id: self.customer.clone(),
            status,
            current_period_start: self.current_period_start.map(unix_timestamp).transpose()?,
            current_period_end: self.current_period_end.map(unix_timestamp).transpose()?,
            cancel_at_period_end: self.cancel_at_period_end,
        })
    }
}

#[derive(Debug, Deserialize)]
struct CheckoutObject {
    #[allow(dead_code)]
    id: String,
    /// The provider's authoritative subscription object, embedded.
    subscription: SubscriptionObject,
    #[serde(default)]
    metadata: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct InvoiceObject {
    id: String,
    #[serde(default)]
    customer: Option<String>,
    #[serde(default)]
    subscription: Option<String>,
    #[serde(default)]
    amount_due: i64,
    #[serde(default)]
    amount_paid: i64,
}

fn unix_timestamp(ts: i64) -> BillingResult<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp(ts)
        .map_err(|e| BillingError::InvalidInput(format!("invalid timestamp {}: {}", ts, e)))
}

fn data_object(payload: &Value) -> BillingResult<&Value> {
    payload
        .get("data")
        .and_then(|d| d.get("object"))
        .ok_or_else(|| BillingError::InvalidInput("payload missing data.object".to_string()))
}

fn parse_object<T: serde::de::DeserializeOwned>(payload: &Value) -> BillingResult<T> {
    serde_json::from_value(data_object(payload)?.clone())
        .map_err(|e| BillingError::InvalidInput(format!("malformed event object: {}", e)))
}

fn tenant_from_metadata(metadata: &HashMap<String, String>) -> BillingResult<Option<Uuid>> {
    match metadata.get("tenant_id") {
        Some(raw) => Uuid::parse_str(raw)
            .map(Some)
            .map_err(|_| BillingError::InvalidInput(format!("malformed tenant_id: {}", raw))),
        None => Ok(None),
    }
}

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EventKind {
    CheckoutCompleted,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaid,
    InvoicePaymentFailed,
    Unhandled,
}

impl EventKind {
    fn parse(event_type: &str) -> Self {
        match event_type {
            "checkout.completed" | "checkout.session.completed" => EventKind::CheckoutCompleted,
            "subscription.updated" | "customer.subscription.updated" => {
                EventKind::SubscriptionUpdated
            }
            "subscription.deleted" | "customer.subscription.deleted" => {
                EventKind::SubscriptionDeleted
            }
            "invoice.paid" | "invoice.payment_succeeded" => EventKind::InvoicePaid,
            "invoice.payment_failed" => EventKind::InvoicePaymentFailed,
            _ => EventKind::Unhandled,
        }
    }
}

/// What applying an event did, for the event row's `result` column and for
/// the pipeline's follow-up steps.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub tenant_id: Option<Uuid>,
    pub summary: String,
    /// Set when the event opened or extended a payment-failure window; the
    /// pipeline re-evaluates dunning for this tenant.
    pub payment_failed: bool,
}

#[derive(Clone)]
pub struct SubscriptionStateMachine {
    store: SubscriptionStore,
    entitlements: EntitlementResolver,
    notifier: Notifier,
}

impl SubscriptionStateMachine {
    pub fn new(
        store: SubscriptionStore,
        entitlements: EntitlementResolver,
        notifier: Notifier,
    ) -> Self {
        Self {
            store,
            entitlements,
            notifier,
        }
    }

    pub async fn apply(&self, event: &InboundEvent, payload: &Value) -> BillingResult<ApplyOutcome> {
        self.apply_at(event, payload, OffsetDateTime::now_utc())
            .await
    }

    pub async fn apply_at(
        &self,
        event: &InboundEvent,
        payload: &Value,
        now: OffsetDateTime,
    ) -> BillingResult<ApplyOutcome> {
        match EventKind::parse(&event.event_type) {
            EventKind::CheckoutCompleted => self.handle_checkout(event, payload, now).await,
            EventKind::SubscriptionUpdated => {
                self.handle_subscription_updated(event, payload, now).await
            }
            EventKind::SubscriptionDeleted => {
                self.handle_subscription_deleted(event, payload, now).await
            }
            EventKind::InvoicePaid => self.handle_invoice_paid(event, payload, now).await,
            EventKind::InvoicePaymentFailed => {
                self.handle_invoice_payment_failed(event, payload, now).await
            }
            EventKind::Unhandled => {
                info!(
                    provider = %event.provider,
                    event_type = %event.event_type,
                    "Ignoring unhandled webhook event type"
                );
                Ok(ApplyOutcome {
                    tenant_id: None,
                    summary: format!("ignored: {}", event.event_type),
                    payment_failed: false,
                })
            }
        }
    }

    async fn handle_checkout(
        &self,
        event: &InboundEvent,
        payload: &Value,
        now: OffsetDateTime,
    ) -> BillingResult<ApplyOutcome> {
        let checkout: CheckoutObject = parse_object(payload)?;
        let tenant_id = match tenant_from_metadata(&checkout.metadata)?
            .or(tenant_from_metadata(&checkout.subscription.metadata)?)
        {
            Some(id) => id,
            None => {
                self.resolve_tenant_by_customer(event.provider, &checkout.subscription.customer)
                    .await?
            }
        };

        let mut write = checkout.subscription.write()?;
        write.status = SubscriptionStatus::Active;
        let subscription = self
            .store
            .upsert_checkout(tenant_id, event.provider, &write, now)
            .await?;
        self.entitlements.invalidate(tenant_id).await?;

        info!(
            tenant_id = %tenant_id,
            provider = %event.provider,
            subscription_id = %subscription.provider_subscription_id,
            "Subscription activated via checkout"
        );
        self.notifier
            .send(OutboundNotification::Sale {
                tenant_id,
                provider: event.provider,
                provider_subscription_id: subscription.provider_subscription_id.clone(),
            })
            .await;

        Ok(ApplyOutcome {
            tenant_id: Some(tenant_id),
            summary: "subscription activated".to_string(),
            payment_failed: false,
        })
    }

    async fn handle_subscription_updated(
        &self,
        event: &InboundEvent,
        payload: &Value,
        now: OffsetDateTime,
    ) -> BillingResult<ApplyOutcome> {
        let object: SubscriptionObject = parse_object(payload)?;
        let write = object.write()?;
        match self.store.apply_update(event.provider, &write, now).await? {
            Some(subscription) => {
                self.entitlements.invalidate(subscription.tenant_id).await?;
                info!(
                    tenant_id = %subscription.tenant_id,
                    status = %subscription.status,
                    "Subscription updated"
                );
                Ok(ApplyOutcome {
                    tenant_id: Some(subscription.tenant_id),
                    summary: format!("subscription updated: {}", subscription.status),
                    payment_failed: false,
                })
            }
            // Out-of-order delivery: the update can land before the checkout
            // that creates the record. Fail so the event stays replayable.
            None => Err(BillingError::Handler(format!(
                "update for unknown subscription {}",
                write.provider_subscription_id
            ))),
        }
    }

    async fn handle_subscription_deleted(
        &self,
        event: &InboundEvent,
        payload: &Value,
        now: OffsetDateTime,
    ) -> BillingResult<ApplyOutcome> {
        let object: SubscriptionObject = parse_object(payload)?;
        match self
            .store
            .end_subscription(event.provider, &object.id, now)
            .await?
        {
            Some(subscription) => {
                self.entitlements.invalidate(subscription.tenant_id).await?;
                info!(
                    tenant_id = %subscription.tenant_id,
                    subscription_id = %object.id,
                    "Subscription ended"
                );
                Ok(ApplyOutcome {
                    tenant_id: Some(subscription.tenant_id),
                    summary: "subscription ended".to_string(),
                    payment_failed: false,
                })
            }
            None => {
                // Deletion is terminal, so an unknown or already-ended
                // subscription needs no further work.
                warn!(
                    provider = %event.provider,
                    subscription_id = %object.id,
                    "Deletion for unknown or already-ended subscription"
                );
                Ok(ApplyOutcome {
                    tenant_id: None,
                    summary: "subscription already ended or unknown".to_string(),
                    payment_failed: false,
                })
            }
        }
    }

    async fn handle_invoice_paid(
        &self,
        event: &InboundEvent,
        payload: &Value,
        now: OffsetDateTime,
    ) -> BillingResult<ApplyOutcome> {
        let invoice: InvoiceObject = parse_object(payload)?;
        // One-off invoices carry no subscription and no lifecycle
        // transition; recording them is all there is to do.
        let Some(provider_subscription_id) = invoice.subscription.clone() else {
            return self
                .record_unlinked_invoice(event, &invoice, "paid", Some(now))
                .await;
        };

        let subscription = self
            .store
            .mark_invoice_paid(event.provider, &provider_subscription_id, now)
            .await?
            .ok_or_else(|| {
                BillingError::Handler(format!(
                    "payment for unknown subscription {}",
                    provider_subscription_id
                ))
            })?;

        self.store
            .upsert_invoice(InvoiceRecord {
                id: Uuid::new_v4(),
                tenant_id: subscription.tenant_id,
                provider: event.provider,
                provider_invoice_id: invoice.id,
                provider_subscription_id: Some(provider_subscription_id),
                amount_cents: invoice.amount_paid.max(invoice.amount_due),
                status: "paid".to_string(),
                paid_at: Some(now),
            })
            .await?;
        self.entitlements.invalidate(subscription.tenant_id).await?;

        info!(
            tenant_id = %subscription.tenant_id,
            "Invoice paid, dunning window cleared"
        );
        Ok(ApplyOutcome {
            tenant_id: Some(subscription.tenant_id),
            summary: "invoice paid".to_string(),
            payment_failed: false,
        })
    }

    async fn handle_invoice_payment_failed(
        &self,
        event: &InboundEvent,
        payload: &Value,
        now: OffsetDateTime,
    ) -> BillingResult<ApplyOutcome> {
        let invoice: InvoiceObject = parse_object(payload)?;
        // A failed one-off invoice opens no dunning window; there is no
        // subscription to fall past due.
        let Some(provider_subscription_id) = invoice.subscription.clone() else {
            return self
                .record_unlinked_invoice(event, &invoice, "payment_failed", None)
                .await;
        };

        let subscription = self
            .store
            .mark_payment_failed(event.provider, &provider_subscription_id, now)
            .await?
            .ok_or_else(|| {
                BillingError::Handler(format!(
                    "payment failure for unknown subscription {}",
                    provider_subscription_id
                ))
            })?;

        self.store
            .upsert_invoice(InvoiceRecord {
                id: Uuid::new_v4(),
                tenant_id: subscription.tenant_id,
                provider: event.provider,
                provider_invoice_id: invoice.id,
                provider_subscription_id: Some(provider_subscription_id),
                amount_cents: invoice.amount_due,
                status: "payment_failed".to_string(),
                paid_at: None,
            })
            .await?;
        self.entitlements.invalidate(subscription.tenant_id).await?;

        warn!(
            tenant_id = %subscription.tenant_id,
            failed_at = %subscription.last_payment_failed_at.unwrap_or(now),
            "Invoice payment failed, dunning window open"
        );
        Ok(ApplyOutcome {
            tenant_id: Some(subscription.tenant_id),
            summary: "payment failure recorded".to_string(),
            payment_failed: true,
        })
    }

    /// Record an invoice that has no subscription link. When the customer
    /// maps to a known tenant the invoice is stored for audit; otherwise
    /// there is nothing to attach it to and the event succeeds as a no-op.
    /// Failing here instead would leave the provider redelivering an event
    /// that can never succeed.
    async fn record_unlinked_invoice(
        &self,
        event: &InboundEvent,
        invoice: &InvoiceObject,
        status: &str,
        paid_at: Option<OffsetDateTime>,
    ) -> BillingResult<ApplyOutcome> {
        let tenant_id = match &invoice.customer {
            Some(customer) => {
                self.store
                    .find_tenant_by_customer(event.provider, customer)
                    .await?
            }
            None => None,
        };
        let Some(tenant_id) = tenant_id else {
            warn!(
                provider = %event.provider,
                invoice_id = %invoice.id,
                "Invoice without subscription or known customer, nothing to record"
            );
            return Ok(ApplyOutcome {
                tenant_id: None,
                summary: "invoice without subscription ignored".to_string(),
                payment_failed: false,
            });
        };

        self.store
            .upsert_invoice(InvoiceRecord {
                id: Uuid::new_v4(),
                tenant_id,
                provider: event.provider,
                provider_invoice_id: invoice.id.clone(),
                provider_subscription_id: None,
                amount_cents: invoice.amount_paid.max(invoice.amount_due),
                status: status.to_string(),
                paid_at,
            })
            .await?;

        info!(
            tenant_id = %tenant_id,
            invoice_id = %invoice.id,
            status = %status,
            "Unlinked invoice recorded for audit"
        );
        Ok(ApplyOutcome {
            tenant_id: Some(tenant_id),
            summary: "invoice recorded without subscription".to_string(),
            payment_failed: false,
        })
    }

    async fn resolve_tenant_by_customer(
        &self,
        provider: Provider,
        provider_customer_id: &str,
    ) -> BillingResult<Uuid> {
        self.store
            .find_tenant_by_customer(provider, provider_customer_id)
            .await?
            .ok_or_else(|| {
                BillingError::Handler(format!(
                    "no tenant mapping for customer {}",
                    provider_customer_id
                ))
            })
    }
}
