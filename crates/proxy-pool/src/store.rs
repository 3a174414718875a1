//! Warm-start persistence.
//!
//! The engine consumes a tiny key-value contract and stores two JSON arrays
//! under well-known keys. The cache is an aid, never a correctness
//! dependency: a missing key is an empty list, while a present-but-corrupt
//! payload is surfaced as [`PoolError::Cache`].

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::debug;

use crate::error::{PoolError, Result};
use crate::proxy::Proxy;

pub const CACHED_PROXIES_KEY: &str = "CACHED_PROXIES";
pub const CACHED_VALIDATED_PROXIES_KEY: &str = "CACHED_VALIDATED_PROXIES";

/// Key-value contract the host satisfies; string keys, UTF-8 values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get_string(&self, key: &str) -> AnyResult<Option<String>>;
    async fn set_string(&self, key: &str, value: &str) -> AnyResult<()>;
    async fn get_bytes(&self, key: &str) -> AnyResult<Option<Vec<u8>>>;
    async fn set_bytes(&self, key: &str, value: &[u8]) -> AnyResult<()>;
    async fn delete(&self, key: &str) -> AnyResult<()>;
    async fn clear(&self) -> AnyResult<()>;
}

/// In-memory reference store.
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get_string(&self, key: &str) -> AnyResult<Option<String>> {
        match self.entries.read().get(key) {
            Some(bytes) => Ok(Some(String::from_utf8(bytes.clone())?)),
            None => Ok(None),
        }
    }

    async fn set_string(&self, key: &str, value: &str) -> AnyResult<()> {
        self.entries.write().insert(key.to_string(), value.as_bytes().to_vec());
        Ok(())
    }

    async fn get_bytes(&self, key: &str) -> AnyResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set_bytes(&self, key: &str, value: &[u8]) -> AnyResult<()> {
        self.entries.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> AnyResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    async fn clear(&self) -> AnyResult<()> {
        self.entries.write().clear();
        Ok(())
    }
}

/// Typed facade over the KV store for the two proxy lists.
pub struct ProxyCache {
    kv: Arc<dyn KeyValueStore>,
}

impl ProxyCache {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }

    pub async fn load_proxies(&self) -> Result<Vec<Proxy>> {
        self.load(CACHED_PROXIES_KEY).await
    }

    pub async fn load_validated(&self) -> Result<Vec<Proxy>> {
        self.load(CACHED_VALIDATED_PROXIES_KEY).await
    }

    pub async fn store_proxies(&self, proxies: &[Proxy]) -> Result<()> {
        self.store(CACHED_PROXIES_KEY, proxies).await
    }

    pub async fn store_validated(&self, proxies: &[Proxy]) -> Result<()> {
        self.store(CACHED_VALIDATED_PROXIES_KEY, proxies).await
    }

    pub async fn clear(&self) -> Result<()> {
        self.kv
            .delete(CACHED_PROXIES_KEY)
            .await
            .map_err(|e| PoolError::Cache(e.to_string()))?;
        self.kv
            .delete(CACHED_VALIDATED_PROXIES_KEY)
            .await
            .map_err(|e| PoolError::Cache(e.to_string()))
    }

    async fn load(&self, key: &str) -> Result<Vec<Proxy>> {
        let raw = self
            .kv
            .get_string(key)
            .await
            .map_err(|e| PoolError::Cache(e.to_string()))?;
        match raw {
            Some(json) => {
                let proxies: Vec<Proxy> =
                    serde_json::from_str(&json).map_err(|e| PoolError::Cache(e.to_string()))?;
                debug!("loaded {} proxies from {}", proxies.len(), key);
                Ok(proxies)
            }
            None => Ok(Vec::new()),
        }
    }

    async fn store(&self, key: &str, proxies: &[Proxy]) -> Result<()> {
        // Canonical dump: serde_json's value maps keep keys sorted.
        let value = serde_json::to_value(proxies).map_err(|e| PoolError::Cache(e.to_string()))?;
        let json = serde_json::to_string(&value).map_err(|e| PoolError::Cache(e.to_string()))?;
        self.kv
            .set_string(key, &json)
            .await
            .map_err(|e| PoolError::Cache(e.to_string()))?;
        debug!("stored {} proxies under {}", proxies.len(), key);
        Ok(())
    }
}
