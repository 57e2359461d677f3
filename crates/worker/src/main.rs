#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Siteforge Background Worker
//!
//! Handles scheduled jobs:
//! - Dunning sweep over past-due subscriptions (hourly)
//! - Recovery of events stuck in `processing` (every 15 minutes)
//! - Health check heartbeat (every 5 minutes)

use std::sync::Arc;

use siteforge_billing::{WebhookConfig, WebhookEngine, STUCK_PROCESSING_MINUTES};
use siteforge_shared::KvStore;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!("Starting Siteforge worker v{}", env!("CARGO_PKG_VERSION"));

    let database_url =
        std::env::var("DATABASE_URL").map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let pool = siteforge_shared::create_pool(&database_url).await?;
    info!("Database pool created");

    let kv = match std::env::var("REDIS_URL") {
        Ok(url) => KvStore::connect(&url).await?,
        Err(_) => {
            warn!("REDIS_URL not set, using in-process store (single instance only)");
            KvStore::new_in_memory()
        }
    };

    let config = WebhookConfig::from_env()?;
    let engine = Arc::new(WebhookEngine::new(config, pool, kv));

    let scheduler = JobScheduler::new().await?;

    // Job 1: Dunning sweep (hourly, at minute 10)
    // Advances reminder stages for past-due subscriptions and downgrades
    // tenants past the hard boundary.
    let sweep_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 10 * * * *", move |_uuid, _l| {
            let engine = sweep_engine.clone();
            Box::pin(async move {
                info!("Running dunning sweep");
                match engine.dunning.sweep().await {
                    Ok(summary) => info!(
                        examined = summary.examined,
                        advanced = summary.advanced,
                        downgraded = summary.downgraded,
                        errors = summary.errors,
                        "Dunning sweep complete"
                    ),
                    Err(e) => error!(error = %e, "Dunning sweep failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Dunning sweep (hourly)");

    // Job 2: Recover stuck events (every 15 minutes)
    // An event left in `processing` past the timeout is moved back to
    // `failed` so replay can pick it up.
    let recover_engine = engine.clone();
    scheduler
        .add(Job::new_async("0 */15 * * * *", move |_uuid, _l| {
            let engine = recover_engine.clone();
            Box::pin(async move {
                match engine.events.recover_stuck(STUCK_PROCESSING_MINUTES).await {
                    Ok(0) => {}
                    Ok(recovered) => {
                        warn!(recovered = recovered, "Recovered stuck webhook events")
                    }
                    Err(e) => error!(error = %e, "Stuck event recovery failed"),
                }
            })
        })?)
        .await?;
    info!("Scheduled: Stuck event recovery (every 15 minutes)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started, jobs scheduled");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping worker");

    Ok(())
}
