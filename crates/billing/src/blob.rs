//! Blob storage for offloaded webhook payloads
//!
//! Payloads above the inline limit are written here and the event row keeps
//! a pointer. Backed by a directory in production and a map in tests.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::{BillingError, BillingResult};
use crate::providers::Provider;
use uuid::Uuid;

#[derive(Clone)]
pub struct BlobStore {
    backend: BlobBackend,
}

#[derive(Clone)]
enum BlobBackend {
    Fs(PathBuf),
    Memory(Arc<RwLock<HashMap<String, Vec<u8>>>>),
}

/// Deterministic key for an offloaded payload.
pub fn payload_key(provider: Provider, storage_id: Uuid) -> String {
    format!("webhooks/{}/{}", provider, storage_id)
}

impl BlobStore {
    pub fn new_fs(root: PathBuf) -> Self {
        Self {
            backend: BlobBackend::Fs(root),
        }
    }

    pub fn new_in_memory() -> Self {
        Self {
            backend: BlobBackend::Memory(Arc::new(RwLock::new(HashMap::new()))),
        }
    }

    pub async fn put(&self, key: &str, bytes: &[u8]) -> BillingResult<()> {
        match &self.backend {
            BlobBackend::Fs(root) => {
                let path = root.join(key);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| BillingError::TransientStore(e.to_string()))?;
                }
                tokio::fs::write(&path, bytes)
                    .await
                    .map_err(|e| BillingError::TransientStore(e.to_string()))?;
            }
            BlobBackend::Memory(map) => {
                map.write().await.insert(key.to_string(), bytes.to_vec());
            }
        }
        Ok(())
    }

    pub async fn get(&self, key: &str) -> BillingResult<Option<Vec<u8>>> {
        match &self.backend {
            BlobBackend::Fs(root) => {
                let path = root.join(key);
                match tokio::fs::read(&path).await {
                    Ok(bytes) => Ok(Some(bytes)),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                    Err(e) => Err(BillingError::TransientStore(e.to_string())),
                }
            }
            BlobBackend::Memory(map) => Ok(map.read().await.get(key).cloned()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let store = BlobStore::new_in_memory();
        let key = payload_key(Provider::Stripe, Uuid::new_v4());
        store.put(&key, b"payload bytes").await.unwrap();
        assert_eq!(
            store.get(&key).await.unwrap(),
            Some(b"payload bytes".to_vec())
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_none() {
        let store = BlobStore::new_in_memory();
        assert_eq!(store.get("webhooks/stripe/missing").await.unwrap(), None);
    }
}
