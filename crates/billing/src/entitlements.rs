//! Entitlement resolution
//!
//! Maps the tenant's subscription record to the feature set and quotas the
//! rest of the product enforces. Resolution is read-heavy, so results are
//! cached briefly; every mutation of subscription state invalidates the
//! cache synchronously before it returns, which keeps the read path at most
//! one TTL behind and exact immediately after any billing event.

use serde::{Deserialize, Serialize};
use siteforge_shared::{KvStore, Plan};
use time::OffsetDateTime;
use tracing::warn;
use uuid::Uuid;

use crate::dunning::{DunningState, HARD_DOWNGRADE_DAYS};
use crate::error::BillingResult;
use crate::subscriptions::{SubscriptionStatus, SubscriptionStore};

/// Cached entitlements expire after this many seconds.
pub const ENTITLEMENT_CACHE_TTL_SECONDS: u64 = 300;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementFeatures {
    pub custom_domains: bool,
    pub monetization: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitlementQuotas {
    pub max_sites: u32,
    pub max_pages_per_site: u32,
    pub ai_generations_per_month: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entitlements {
    pub plan: Plan,
    pub features: EntitlementFeatures,
    pub quotas: EntitlementQuotas,
    /// End of the paid period, when known. `None` for the free plan.
    #[serde(with = "time::serde::rfc3339::option")]
    pub valid_until: Option<OffsetDateTime>,
}

impl Entitlements {
    pub fn for_plan(plan: Plan, valid_until: Option<OffsetDateTime>) -> Self {
        Self {
            plan,
            features: EntitlementFeatures {
                custom_domains: plan.custom_domains_enabled(),
                monetization: plan.monetization_enabled(),
            },
            quotas: EntitlementQuotas {
                max_sites: plan.max_sites(),
                max_pages_per_site: plan.max_pages_per_site(),
                ai_generations_per_month: plan.ai_generations_per_month(),
            },
            valid_until,
        }
    }

    pub fn free() -> Self {
        Self::for_plan(Plan::Free, None)
    }
}

#[derive(Clone)]
pub struct EntitlementResolver {
    store: SubscriptionStore,
    cache: KvStore,
}

impl EntitlementResolver {
    pub fn new(store: SubscriptionStore, cache: KvStore) -> Self {
        Self { store, cache }
    }

    fn cache_key(tenant_id: Uuid) -> String {
        format!("entitlements:{}", tenant_id)
    }

    pub async fn resolve(&self, tenant_id: Uuid) -> BillingResult<Entitlements> {
        self.resolve_at(tenant_id, OffsetDateTime::now_utc()).await
    }

    pub async fn resolve_at(
        &self,
        tenant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Entitlements> {
        let key = Self::cache_key(tenant_id);
        // A cache outage degrades to a direct resolution, never an error.
        match self.cache.get(&key).await {
            Ok(Some(cached)) => {
                if let Ok(entitlements) = serde_json::from_str::<Entitlements>(&cached) {
                    return Ok(entitlements);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Entitlement cache read failed");
            }
        }

        let entitlements = self.compute(tenant_id, now).await?;

        match serde_json::to_string(&entitlements) {
            Ok(serialized) => {
                if let Err(e) = self
                    .cache
                    .put(&key, &serialized, Some(ENTITLEMENT_CACHE_TTL_SECONDS))
                    .await
                {
                    warn!(tenant_id = %tenant_id, error = %e, "Entitlement cache write failed");
                }
            }
            Err(e) => {
                warn!(tenant_id = %tenant_id, error = %e, "Entitlement serialization failed");
            }
        }

        Ok(entitlements)
    }

    /// Drop the cached entry. Called synchronously by every subscription
    /// mutation before it reports success; a failure here surfaces as a
    /// transient error so the triggering event is retried rather than
    /// leaving a stale grant behind.
    pub async fn invalidate(&self, tenant_id: Uuid) -> BillingResult<()> {
        self.cache.delete(&Self::cache_key(tenant_id)).await?;
        Ok(())
    }

    async fn compute(&self, tenant_id: Uuid, now: OffsetDateTime) -> BillingResult<Entitlements> {
        let Some(subscription) = self.store.get_current(tenant_id).await? else {
            return Ok(Entitlements::free());
        };

        if !subscription.status.grants_paid_plan() {
            return Ok(Entitlements::free());
        }

        // A past-due plan survives its payment failure until the
        // hard-downgrade boundary. Only past_due is subject to the boundary:
        // a provider reporting the subscription active again outranks a
        // stale failure timestamp.
        if subscription.status == SubscriptionStatus::PastDue {
            let dunning = DunningState::compute(subscription.last_payment_failed_at, now);
            if dunning.days_past_due >= HARD_DOWNGRADE_DAYS {
                return Ok(Entitlements::free());
            }
        }

        Ok(Entitlements::for_plan(
            Plan::Paid,
            subscription.current_period_end,
        ))
    }
}
