//! Key/value store abstraction
//!
//! Backs the idempotency ledger (`idempo:<provider>:<id>`) and the
//! entitlement cache (`entitlements:<tenant_id>`). Production uses Redis via
//! a connection manager; tests use the in-memory backend so they run without
//! external services.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::RwLock;

/// Errors from the key/value store.
///
/// Callers treat any `KvError` as a transient outage: the store is a cache,
/// never the source of truth, so the durable path (the event store) remains
/// authoritative when this fails.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
}

#[derive(Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Clone)]
enum KvBackend {
    Redis(ConnectionManager),
    Memory(Arc<RwLock<HashMap<String, MemoryEntry>>>),
}

/// Shared key/value store with Redis and in-memory backends.
#[derive(Clone)]
pub struct KvStore {
    backend: KvBackend,
}

impl KvStore {
    /// Connect to Redis. The connection manager reconnects automatically and
    /// bounds individual commands with its own timeouts.
    pub async fn connect(redis_url: &str) -> Result<Self, KvError> {
        let client = redis::Client::open(redis_url)?;
        let manager = ConnectionManager::new(client).await?;
        tracing::info!("Connected to Redis key/value store");
        Ok(Self {
            backend: KvBackend::Redis(manager),
        })
    }

    /// In-memory backend for tests and single-process development.
    pub fn new_in_memory() -> Self {
        Self {
            backend: KvBackend::Memory(Arc::new(RwLock::new(HashMap::new()))),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        match &self.backend {
            KvBackend::Redis(manager) => {
                let mut conn = manager.clone();
                let value: Option<String> = conn.get(key).await?;
                Ok(value)
            }
            KvBackend::Memory(map) => {
                let guard = map.read().await;
                match guard.get(key) {
                    Some(entry) => {
                        if let Some(expires_at) = entry.expires_at {
                            if Instant::now() >= expires_at {
                                return Ok(None);
                            }
                        }
                        Ok(Some(entry.value.clone()))
                    }
                    None => Ok(None),
                }
            }
        }
    }

    /// Store a value. `ttl_seconds = None` means no expiry.
    pub async fn put(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: Option<u64>,
    ) -> Result<(), KvError> {
        match &self.backend {
            KvBackend::Redis(manager) => {
                let mut conn = manager.clone();
                match ttl_seconds {
                    Some(ttl) => {
                        let _: () = conn.set_ex(key, value, ttl).await?;
                    }
                    None => {
                        let _: () = conn.set(key, value).await?;
                    }
                }
                Ok(())
            }
            KvBackend::Memory(map) => {
                let mut guard = map.write().await;
                guard.insert(
                    key.to_string(),
                    MemoryEntry {
                        value: value.to_string(),
                        expires_at: ttl_seconds.map(|t| Instant::now() + Duration::from_secs(t)),
                    },
                );
                Ok(())
            }
        }
    }

    pub async fn delete(&self, key: &str) -> Result<(), KvError> {
        match &self.backend {
            KvBackend::Redis(manager) => {
                let mut conn = manager.clone();
                let _: () = conn.del(key).await?;
                Ok(())
            }
            KvBackend::Memory(map) => {
                let mut guard = map.write().await;
                guard.remove(key);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let kv = KvStore::new_in_memory();
        kv.put("k1", "v1", None).await.unwrap();
        assert_eq!(kv.get("k1").await.unwrap(), Some("v1".to_string()));
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let kv = KvStore::new_in_memory();
        assert_eq!(kv.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_delete_removes_key() {
        let kv = KvStore::new_in_memory();
        kv.put("k1", "v1", Some(3600)).await.unwrap();
        kv.delete("k1").await.unwrap();
        assert_eq!(kv.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_zero_ttl_expires_immediately() {
        let kv = KvStore::new_in_memory();
        kv.put("k1", "v1", Some(0)).await.unwrap();
        assert_eq!(kv.get("k1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_overwrite_replaces_value() {
        let kv = KvStore::new_in_memory();
        kv.put("k1", "v1", None).await.unwrap();
        kv.put("k1", "v2", None).await.unwrap();
        assert_eq!(kv.get("k1").await.unwrap(), Some("v2".to_string()));
    }
}
