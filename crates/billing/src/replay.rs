//! Replay controller
//!
//! Re-drives stored events through the same processing tail as live
//! ingestion. Replay never bypasses the state machine's idempotency, so
//! replaying is always safe; the controller only decides whether a replay
//! is allowed at all.

use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::EventStatus;
use crate::pipeline::WebhookPipeline;

/// Retry ceiling per event, counting both provider redeliveries of failed
/// events and operator-initiated replays.
pub const MAX_REPLAY_ATTEMPTS: i32 = 5;

#[derive(Debug, Clone, Serialize)]
pub struct ReplayOutcome {
    pub storage_id: Uuid,
    /// Whether the replay was allowed to run. A replay that ran but failed
    /// again still reports `accepted: true` with the failure in `reason`.
    pub accepted: bool,
    pub reason: Option<String>,
    /// Processing summary when the replay succeeded.
    pub result: Option<String>,
}

impl ReplayOutcome {
    fn refused(storage_id: Uuid, reason: &str) -> Self {
        Self {
            storage_id,
            accepted: false,
            reason: Some(reason.to_string()),
            result: None,
        }
    }
}

#[derive(Clone)]
pub struct ReplayController {
    pipeline: WebhookPipeline,
}

impl ReplayController {
    pub fn new(pipeline: WebhookPipeline) -> Self {
        Self { pipeline }
    }

    /// Replay a single stored event by storage id.
    pub async fn replay(&self, storage_id: Uuid) -> BillingResult<ReplayOutcome> {
        let Some(event) = self.pipeline.events().get(storage_id).await? else {
            return Ok(ReplayOutcome::refused(storage_id, "event not found"));
        };

        if event.status == EventStatus::Processed {
            return Ok(ReplayOutcome::refused(
                storage_id,
                &BillingError::AlreadyProcessed.to_string(),
            ));
        }
        if event.retry_count >= MAX_REPLAY_ATTEMPTS {
            warn!(
                storage_id = %storage_id,
                retry_count = event.retry_count,
                "Replay refused, retry ceiling reached"
            );
            return Ok(ReplayOutcome::refused(
                storage_id,
                &BillingError::RetryExhausted.to_string(),
            ));
        }

        // The claim is conditional, so a concurrent replay or an in-flight
        // live delivery wins and this one backs off.
        let Some(claimed) = self
            .pipeline
            .events()
            .claim_for_replay(storage_id, MAX_REPLAY_ATTEMPTS)
            .await?
        else {
            return Ok(ReplayOutcome::refused(storage_id, "event is being processed"));
        };

        info!(
            storage_id = %storage_id,
            provider = %claimed.provider,
            retry_count = claimed.retry_count,
            "Replaying webhook event"
        );
        match self.pipeline.process_stored(&claimed).await {
            Ok(summary) => Ok(ReplayOutcome {
                storage_id,
                accepted: true,
                reason: None,
                result: Some(summary),
            }),
            Err(e) => Ok(ReplayOutcome {
                storage_id,
                accepted: true,
                reason: Some(format!("replay failed: {}", e)),
                result: None,
            }),
        }
    }

    /// Replay every failed event that still has retries left, oldest first.
    pub async fn replay_all_failed(&self, limit: i64) -> BillingResult<Vec<ReplayOutcome>> {
        let ids = self
            .pipeline
            .events()
            .failed_event_ids(MAX_REPLAY_ATTEMPTS, limit)
            .await?;
        let mut outcomes = Vec::with_capacity(ids.len());
        for id in ids {
            outcomes.push(self.replay(id).await?);
        }

        let succeeded = outcomes
            .iter()
            .filter(|o| o.accepted && o.result.is_some())
            .count();
        info!(
            attempted = outcomes.len(),
            succeeded,
            "Bulk replay of failed events complete"
        );
        Ok(outcomes)
    }
}
