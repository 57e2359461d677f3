// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Siteforge Billing Module
//!
//! Webhook ingestion and subscription reliability for the site builder.
//!
//! ## Features
//!
//! - **Signature Verification**: Per-provider HMAC schemes, fail closed
//! - **Idempotency Ledger**: Duplicate deliveries acknowledged without re-applying effects
//! - **Event Store**: Durable, redacted record of every verified delivery, with blob offload
//! - **Replay**: Re-drive failed events through the same processing path
//! - **Subscription State Machine**: Provider lifecycle events to tenant subscription state
//! - **Entitlements**: Cached plan/feature/quota resolution with synchronous invalidation
//! - **Dunning**: Staged payment-failure reminders ending in a hard downgrade
//! - **Outbound Notifications**: Signed sale and reminder webhooks, best-effort

pub mod blob;
pub mod config;
pub mod dunning;
pub mod entitlements;
pub mod error;
pub mod events;
pub mod ledger;
pub mod notify;
pub mod pipeline;
pub mod providers;
pub mod redact;
pub mod replay;
pub mod subscriptions;
pub mod verify;

#[cfg(test)]
mod edge_case_tests;

// Blob storage
pub use blob::{payload_key, BlobStore};

// Config
pub use config::WebhookConfig;

// Dunning
pub use dunning::{
    DunningScheduler, DunningState, SweepSummary, HARD_DOWNGRADE_DAYS, MAX_DUNNING_STAGE,
    STAGE_THRESHOLD_DAYS,
};

// Entitlements
pub use entitlements::{
    EntitlementFeatures, EntitlementQuotas, EntitlementResolver, Entitlements,
    ENTITLEMENT_CACHE_TTL_SECONDS,
};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{
    EventOutcome, EventStatus, EventStore, InboundEvent, StoredEvent, INLINE_PAYLOAD_LIMIT,
    STUCK_PROCESSING_MINUTES,
};

// Ledger
pub use ledger::{IdempotencyLedger, LedgerEntry, IDEMPOTENCY_TTL_SECONDS};

// Notifications
pub use notify::{Notifier, OutboundNotification};

// Pipeline
pub use pipeline::{IngestOutcome, WebhookPipeline};

// Providers
pub use providers::Provider;

// Redaction
pub use redact::{redact_payload, sanitize_event_type, REDACTED_MARKER};

// Replay
pub use replay::{ReplayController, ReplayOutcome, MAX_REPLAY_ATTEMPTS};

// Subscriptions
pub use subscriptions::{
    ApplyOutcome, InvoiceRecord, Subscription, SubscriptionStateMachine, SubscriptionStatus,
    SubscriptionStore, SubscriptionWrite,
};

// Verification
pub use verify::{
    SignatureHeaders, SignatureVerifier, Verification, SIGNATURE_TOLERANCE_SECONDS,
};

use siteforge_shared::KvStore;
use sqlx::PgPool;

/// Everything the webhook engine needs, wired together.
pub struct WebhookEngine {
    pub pipeline: WebhookPipeline,
    pub replay: ReplayController,
    pub events: EventStore,
    pub subscriptions: SubscriptionStore,
    pub entitlements: EntitlementResolver,
    pub dunning: DunningScheduler,
}

impl WebhookEngine {
    /// Production wiring: Postgres for events and subscriptions, the shared
    /// KV store for the ledger and entitlement cache, filesystem blobs when
    /// a root is configured.
    pub fn new(config: WebhookConfig, pool: PgPool, kv: KvStore) -> Self {
        let blobs = match &config.blob_root {
            Some(root) => BlobStore::new_fs(root.clone()),
            None => BlobStore::new_in_memory(),
        };
        let events = EventStore::new_postgres(pool.clone(), blobs);
        let subscriptions = SubscriptionStore::new_postgres(pool);
        let notifier = match &config.outbound_webhook_url {
            Some(url) => {
                Notifier::new_http(url.clone(), config.outbound_webhook_secret.clone())
            }
            None => Notifier::disabled(),
        };
        Self::wire(config, kv, events, subscriptions, notifier)
    }

    /// Fully in-process wiring for tests and local development.
    pub fn new_in_memory(config: WebhookConfig) -> Self {
        Self::wire(
            config,
            KvStore::new_in_memory(),
            EventStore::new_in_memory(),
            SubscriptionStore::new_in_memory(),
            Notifier::new_in_memory(),
        )
    }

    fn wire(
        config: WebhookConfig,
        kv: KvStore,
        events: EventStore,
        subscriptions: SubscriptionStore,
        notifier: Notifier,
    ) -> Self {
        let entitlements = EntitlementResolver::new(subscriptions.clone(), kv.clone());
        let machine = SubscriptionStateMachine::new(
            subscriptions.clone(),
            entitlements.clone(),
            notifier.clone(),
        );
        let dunning =
            DunningScheduler::new(subscriptions.clone(), entitlements.clone(), notifier);
        let pipeline = WebhookPipeline::new(
            SignatureVerifier::new(config),
            IdempotencyLedger::new(kv),
            events.clone(),
            machine,
            dunning.clone(),
        );
        let replay = ReplayController::new(pipeline.clone());

        Self {
            pipeline,
            replay,
            events,
            subscriptions,
            entitlements,
            dunning,
        }
    }
}
