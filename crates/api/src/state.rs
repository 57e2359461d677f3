//! Application state

use std::sync::Arc;

use siteforge_billing::{WebhookConfig, WebhookEngine};
use siteforge_shared::KvStore;
use sqlx::PgPool;

use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub engine: Arc<WebhookEngine>,
}

impl AppState {
    pub fn new(pool: PgPool, kv: KvStore, webhook_config: WebhookConfig) -> Self {
        let engine = WebhookEngine::new(webhook_config, pool.clone(), kv);
        Self {
            pool,
            engine: Arc::new(engine),
        }
    }

    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = siteforge_shared::create_pool(&config.database_url).await?;

        let kv = match &config.redis_url {
            Some(url) => {
                let kv = KvStore::connect(url).await?;
                tracing::info!("Redis connected for ledger and entitlement cache");
                kv
            }
            None => {
                tracing::warn!(
                    "REDIS_URL not set, using in-process store (single instance only)"
                );
                KvStore::new_in_memory()
            }
        };

        let webhook_config = WebhookConfig::from_env()?;
        Ok(Self::new(pool, kv, webhook_config))
    }
}
