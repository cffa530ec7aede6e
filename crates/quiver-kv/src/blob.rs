//! Blob store abstraction for binlogs and index files.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use quiver_common::{Error, Result};
use std::collections::BTreeMap;

/// Object storage used for segment binlogs and built index files.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Bytes>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn remove(&self, key: &str) -> Result<()>;

    /// Delete every object under `prefix`; absent prefixes are a no-op.
    async fn remove_with_prefix(&self, prefix: &str) -> Result<()>;

    async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory blob store.
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("object {key}")))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().contains_key(key))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.objects.write().remove(key);
        Ok(())
    }

    async fn remove_with_prefix(&self, prefix: &str) -> Result<()> {
        let mut objects = self.objects.write();
        let keys: Vec<String> = objects
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        for k in keys {
            objects.remove(&k);
        }
        Ok(())
    }

    async fn list_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
