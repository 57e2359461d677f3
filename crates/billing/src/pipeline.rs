//! Webhook ingestion pipeline
//!
//! The full receive path: verify signature, suppress duplicates, persist,
//! apply to the subscription state machine, record the outcome. Everything
//! after persistence is replayable; everything before it is cheap to reject.

use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::dunning::DunningScheduler;
use crate::error::{BillingError, BillingResult};
use crate::events::{EventOutcome, EventStatus, EventStore, InboundEvent};
use crate::ledger::IdempotencyLedger;
use crate::providers::Provider;
use crate::subscriptions::SubscriptionStateMachine;
use crate::verify::{SignatureHeaders, SignatureVerifier};

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum IngestOutcome {
    /// Verified, stored, and applied.
    Accepted { storage_id: Uuid, summary: String },
    /// Already seen; no effects were re-applied.
    Duplicate { storage_id: Option<Uuid> },
}

#[derive(Clone)]
pub struct WebhookPipeline {
    verifier: SignatureVerifier,
    ledger: IdempotencyLedger,
    events: EventStore,
    machine: SubscriptionStateMachine,
    dunning: DunningScheduler,
}

impl WebhookPipeline {
    pub fn new(
        verifier: SignatureVerifier,
        ledger: IdempotencyLedger,
        events: EventStore,
        machine: SubscriptionStateMachine,
        dunning: DunningScheduler,
    ) -> Self {
        Self {
            verifier,
            ledger,
            events,
            machine,
            dunning,
        }
    }

    pub fn events(&self) -> &EventStore {
        &self.events
    }

    pub fn dunning(&self) -> &DunningScheduler {
        &self.dunning
    }

    /// Process one inbound delivery end to end.
    pub async fn ingest(
        &self,
        provider: Provider,
        raw_body: &[u8],
        headers: &SignatureHeaders,
    ) -> BillingResult<IngestOutcome> {
        // Signature first: nothing unverified is parsed into the domain or
        // persisted.
        let verification = self.verifier.verify(provider, raw_body, headers)?;

        // Fast-path duplicate suppression. A ledger outage falls through to
        // the event store's persistent check rather than rejecting.
        if let Some(provider_event_id) = &verification.provider_event_id {
            match self.ledger.is_processed(provider, provider_event_id).await {
                Ok(true) => {
                    info!(
                        provider = %provider,
                        provider_event_id = %provider_event_id,
                        "Duplicate delivery suppressed by ledger"
                    );
                    return Ok(IngestOutcome::Duplicate { storage_id: None });
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(provider = %provider, error = %e, "Idempotency ledger unavailable");
                }
            }
        }

        let payload: Value = serde_json::from_slice(raw_body).unwrap_or(Value::Null);
        let event_type = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string();

        let stored = self
            .events
            .store(
                provider,
                verification.provider_event_id.clone(),
                &event_type,
                payload,
            )
            .await?;

        if !stored.created {
            match stored.event.status {
                // Fully applied or being applied right now: acknowledge
                // without re-running effects.
                EventStatus::Processed | EventStatus::Processing => {
                    info!(
                        provider = %provider,
                        storage_id = %stored.event.id,
                        status = %stored.event.status,
                        "Duplicate delivery suppressed by event store"
                    );
                    return Ok(IngestOutcome::Duplicate {
                        storage_id: Some(stored.event.id),
                    });
                }
                // A redelivery of an event that never finished is a retry.
                EventStatus::Pending | EventStatus::Failed => {}
            }
        }

        let summary = self.process_stored(&stored.event).await?;
        Ok(IngestOutcome::Accepted {
            storage_id: stored.event.id,
            summary,
        })
    }

    /// The processing tail shared by ingestion and replay: apply the stored
    /// event, record the outcome, settle the ledger, re-evaluate dunning.
    pub async fn process_stored(&self, event: &InboundEvent) -> BillingResult<String> {
        self.events.mark_processing(event.id).await?;
        let payload = self.events.load_payload(event).await?;

        match self.machine.apply(event, &payload).await {
            Ok(outcome) => {
                self.events
                    .mark_outcome(
                        event.id,
                        &EventOutcome::Success {
                            result: Some(outcome.summary.clone()),
                        },
                    )
                    .await?;

                // Ledger entry only after the effects landed. A write
                // failure costs a redundant (idempotent) reprocess later,
                // not correctness.
                if let Err(e) = self
                    .ledger
                    .mark_processed(
                        event.provider,
                        &event.provider_event_id,
                        Some(&outcome.summary),
                    )
                    .await
                {
                    warn!(
                        provider = %event.provider,
                        provider_event_id = %event.provider_event_id,
                        error = %e,
                        "Failed to record idempotency ledger entry"
                    );
                }

                if outcome.payment_failed {
                    if let Some(tenant_id) = outcome.tenant_id {
                        // The subscription change already landed; a reminder
                        // hiccup is logged, not propagated.
                        if let Err(e) = self.dunning.evaluate(tenant_id).await {
                            warn!(
                                tenant_id = %tenant_id,
                                error = %e,
                                "Dunning evaluation after payment failure failed"
                            );
                        }
                    }
                }

                Ok(outcome.summary)
            }
            // The store is unreachable; nothing was recorded, the provider
            // will redeliver.
            Err(e @ BillingError::TransientStore(_)) => Err(e),
            Err(e) => {
                self.events
                    .mark_outcome(
                        event.id,
                        &EventOutcome::Failure {
                            error: e.to_string(),
                        },
                    )
                    .await?;
                warn!(
                    provider = %event.provider,
                    storage_id = %event.id,
                    error = %e,
                    "Webhook event processing failed"
                );
                Err(BillingError::Handler(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WebhookConfig;
    use crate::entitlements::EntitlementResolver;
    use crate::notify::Notifier;
    use crate::subscriptions::{SubscriptionStatus, SubscriptionStore};
    use crate::verify::testsupport::stripe_headers;
    use serde_json::json;
    use siteforge_shared::KvStore;

    fn pipeline() -> (WebhookPipeline, SubscriptionStore, Notifier) {
        let config = WebhookConfig::for_tests();
        let kv = KvStore::new_in_memory();
        let store = SubscriptionStore::new_in_memory();
        let events = EventStore::new_in_memory();
        let entitlements = EntitlementResolver::new(store.clone(), kv.clone());
        let notifier = Notifier::new_in_memory();
        let machine =
            SubscriptionStateMachine::new(store.clone(), entitlements.clone(), notifier.clone());
        let dunning = DunningScheduler::new(store.clone(), entitlements, notifier.clone());
        let pipeline = WebhookPipeline::new(
            SignatureVerifier::new(config),
            IdempotencyLedger::new(kv),
            events,
            machine,
            dunning,
        );
        (pipeline, store, notifier)
    }

    fn signed_stripe(body: &str) -> SignatureHeaders {
        stripe_headers(
            &WebhookConfig::for_tests().stripe_webhook_secret,
            body.as_bytes(),
        )
    }

    fn checkout_body(tenant: Uuid, event_id: &str) -> String {
        json!({
            "id": event_id,
            "type": "checkout.completed",
            "data": { "object": {
                "id": "cs_1",
                "metadata": { "tenant_id": tenant.to_string() },
                "subscription": {
                    "id": "sub_1",
                    "customer": "cus_1",
                    "status": "active",
                },
            }},
        })
        .to_string()
    }

    #[tokio::test]
    async fn test_ingest_applies_and_acknowledges() {
        let (pipeline, store, _) = pipeline();
        let tenant = Uuid::new_v4();
        let body = checkout_body(tenant, "evt_1");

        let outcome = pipeline
            .ingest(Provider::Stripe, body.as_bytes(), &signed_stripe(&body))
            .await
            .unwrap();
        let IngestOutcome::Accepted { storage_id, .. } = outcome else {
            panic!("expected acceptance");
        };

        let event = pipeline.events().get(storage_id).await.unwrap().unwrap();
        assert_eq!(event.status, EventStatus::Processed);
        assert_eq!(
            store.get_current(tenant).await.unwrap().unwrap().status,
            SubscriptionStatus::Active
        );
    }

    #[tokio::test]
    async fn test_duplicate_delivery_applies_once() {
        let (pipeline, _, notifier) = pipeline();
        let tenant = Uuid::new_v4();
        let body = checkout_body(tenant, "evt_1");
        let headers = signed_stripe(&body);

        pipeline
            .ingest(Provider::Stripe, body.as_bytes(), &headers)
            .await
            .unwrap();
        let second = pipeline
            .ingest(Provider::Stripe, body.as_bytes(), &headers)
            .await
            .unwrap();
        assert!(matches!(second, IngestOutcome::Duplicate { .. }));

        // Exactly one sale notification despite two deliveries.
        assert_eq!(notifier.sent().await.len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_signature_rejected_before_persistence() {
        let (pipeline, _, _) = pipeline();
        let body = checkout_body(Uuid::new_v4(), "evt_1");
        let headers = SignatureHeaders {
            signature: Some("t=0,v1=deadbeef".to_string()),
            timestamp: None,
        };

        let err = pipeline
            .ingest(Provider::Stripe, body.as_bytes(), &headers)
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SignatureInvalid));
        assert!(pipeline.events().list(None, 10, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_handler_failure_marks_event_failed() {
        let (pipeline, _, _) = pipeline();
        // Payment failure for a subscription nobody has: deterministic
        // handler failure.
        let body = json!({
            "id": "evt_orphan",
            "type": "invoice.payment_failed",
            "data": { "object": { "id": "in_1", "subscription": "sub_ghost" }},
        })
        .to_string();

        let err = pipeline
            .ingest(Provider::Stripe, body.as_bytes(), &signed_stripe(&body))
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::Handler(_)));

        let failed = pipeline
            .events()
            .list(Some(EventStatus::Failed), 10, 0)
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].retry_count, 0);
        assert!(failed[0].error.is_some());
    }

    #[tokio::test]
    async fn test_redelivery_of_failed_event_retries() {
        let (pipeline, store, _) = pipeline();
        let tenant = Uuid::new_v4();

        // First delivery fails: subscription does not exist yet.
        let update_body = json!({
            "id": "evt_update",
            "type": "subscription.updated",
            "data": { "object": { "id": "sub_1", "customer": "cus_1", "status": "unpaid" }},
        })
        .to_string();
        pipeline
            .ingest(
                Provider::Stripe,
                update_body.as_bytes(),
                &signed_stripe(&update_body),
            )
            .await
            .unwrap_err();

        // Checkout lands, then the provider redelivers the update.
        let checkout = checkout_body(tenant, "evt_checkout");
        pipeline
            .ingest(
                Provider::Stripe,
                checkout.as_bytes(),
                &signed_stripe(&checkout),
            )
            .await
            .unwrap();
        let outcome = pipeline
            .ingest(
                Provider::Stripe,
                update_body.as_bytes(),
                &signed_stripe(&update_body),
            )
            .await
            .unwrap();
        assert!(matches!(outcome, IngestOutcome::Accepted { .. }));
        assert_eq!(
            store.get_current(tenant).await.unwrap().unwrap().status,
            SubscriptionStatus::Unpaid
        );
    }

    #[tokio::test]
    async fn test_unparseable_body_with_valid_signature_is_stored() {
        let (pipeline, _, _) = pipeline();
        let body = "not json at all";
        let outcome = pipeline
            .ingest(Provider::Stripe, body.as_bytes(), &signed_stripe(body))
            .await
            .unwrap();
        // No provider id, no type: stored under a synthetic id and ignored
        // by the state machine.
        let IngestOutcome::Accepted { storage_id, summary } = outcome else {
            panic!("expected acceptance");
        };
        assert_eq!(summary, "ignored: unknown");
        let event = pipeline.events().get(storage_id).await.unwrap().unwrap();
        assert!(event.provider_event_id.starts_with("synthetic-"));
        assert_eq!(event.status, EventStatus::Processed);
    }
}
