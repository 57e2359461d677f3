//! Dunning scheduler
//!
//! Tracks how long a subscription has had an unresolved payment failure and
//! walks it through escalating reminder stages, ending in a hard downgrade
//! to the free plan at 60 days. Stage transitions are driven both by the
//! periodic sweep and by inbound payment-failure events, so a tenant is
//! never waiting on the next sweep for their first reminder.

use serde::Serialize;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entitlements::EntitlementResolver;
use crate::error::BillingResult;
use crate::notify::{Notifier, OutboundNotification};
use crate::subscriptions::SubscriptionStore;

/// Days past due at which each reminder stage begins. Below the first
/// threshold the window is open but no reminder has been earned yet.
pub const STAGE_THRESHOLD_DAYS: [i64; 4] = [7, 14, 30, 60];

/// At this boundary the paid plan is revoked.
pub const HARD_DOWNGRADE_DAYS: i64 = 60;

pub const MAX_DUNNING_STAGE: i16 = 4;

/// Pure function of the failure timestamp and the clock. The stored
/// `last_dunning_stage` only records which reminders were already sent;
/// the stage itself is always recomputed, so a missed sweep can never
/// freeze a tenant at a stale stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DunningState {
    /// 0 while below the first threshold, then 1-4.
    pub stage: i16,
    pub days_past_due: i64,
    /// When the hard downgrade took effect, once past the boundary.
    #[serde(with = "time::serde::rfc3339::option")]
    pub downgrade_at: Option<OffsetDateTime>,
}

impl DunningState {
    pub fn compute(last_payment_failed_at: Option<OffsetDateTime>, now: OffsetDateTime) -> Self {
        let Some(failed_at) = last_payment_failed_at else {
            return Self {
                stage: 0,
                days_past_due: 0,
                downgrade_at: None,
            };
        };
        let days_past_due = (now - failed_at).whole_days().max(0);
        let stage = STAGE_THRESHOLD_DAYS
            .iter()
            .filter(|threshold| days_past_due >= **threshold)
            .count() as i16;
        let downgrade_at = (days_past_due >= HARD_DOWNGRADE_DAYS)
            .then(|| failed_at + time::Duration::days(HARD_DOWNGRADE_DAYS));
        Self {
            stage,
            days_past_due,
            downgrade_at,
        }
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SweepSummary {
    pub examined: usize,
    pub advanced: usize,
    pub downgraded: usize,
    pub errors: usize,
}

#[derive(Clone)]
pub struct DunningScheduler {
    store: SubscriptionStore,
    entitlements: EntitlementResolver,
    notifier: Notifier,
}

impl DunningScheduler {
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

    pub async fn evaluate(&self, tenant_id: Uuid) -> BillingResult<Option<DunningState>> {
        self.evaluate_at(tenant_id, OffsetDateTime::now_utc()).await
    }

    /// Evaluate one tenant's dunning position, sending the reminder and
    /// recording the stage if a new one was reached. Returns the computed
    /// state, or `None` when the tenant has no open failure window.
    pub async fn evaluate_at(
        &self,
        tenant_id: Uuid,
        now: OffsetDateTime,
    ) -> BillingResult<Option<DunningState>> {
        let Some(subscription) = self.store.get_current(tenant_id).await? else {
            return Ok(None);
        };
        if subscription.last_payment_failed_at.is_none() {
            return Ok(None);
        }

        let state = DunningState::compute(subscription.last_payment_failed_at, now);
        if state.stage <= subscription.last_dunning_stage {
            return Ok(Some(state));
        }

        // The conditional write loses against a concurrent sweep that
        // already recorded this stage, in which case the reminder was (or is
        // being) sent by the winner.
        let advanced = self
            .store
            .advance_dunning_stage(subscription.id, state.stage, now)
            .await?;
        if !advanced {
            return Ok(Some(state));
        }

        info!(
            tenant_id = %tenant_id,
            stage = state.stage,
            days_past_due = state.days_past_due,
            "Dunning stage reached"
        );
        self.notifier
            .send(OutboundNotification::DunningReminder {
                tenant_id,
                stage: state.stage,
                days_past_due: state.days_past_due,
            })
            .await;

        // The final stage revokes the paid plan; the invalidation must land
        // before this returns so the next resolution sees the downgrade.
        if state.stage >= MAX_DUNNING_STAGE {
            warn!(tenant_id = %tenant_id, "Dunning window exhausted, downgrading to free");
            self.entitlements.invalidate(tenant_id).await?;
        }

        Ok(Some(state))
    }

    pub async fn sweep(&self) -> BillingResult<SweepSummary> {
        self.sweep_at(OffsetDateTime::now_utc()).await
    }

    /// Evaluate every subscription with an open failure window. Per-tenant
    /// errors are counted and logged, not propagated, so one bad record
    /// cannot stall the rest of the sweep.
    pub async fn sweep_at(&self, now: OffsetDateTime) -> BillingResult<SweepSummary> {
        let past_due = self.store.list_past_due().await?;
        let mut summary = SweepSummary {
            examined: past_due.len(),
            ..SweepSummary::default()
        };

        for subscription in past_due {
            let before = subscription.last_dunning_stage;
            match self.evaluate_at(subscription.tenant_id, now).await {
                Ok(Some(state)) if state.stage > before => {
                    summary.advanced += 1;
                    if state.stage >= MAX_DUNNING_STAGE {
                        summary.downgraded += 1;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        tenant_id = %subscription.tenant_id,
                        error = %e,
                        "Dunning evaluation failed"
                    );
                    summary.errors += 1;
                }
            }
        }

        info!(
            examined = summary.examined,
            advanced = summary.advanced,
            downgraded = summary.downgraded,
            errors = summary.errors,
            "Dunning sweep complete"
        );
        Ok(summary)
    }
}
