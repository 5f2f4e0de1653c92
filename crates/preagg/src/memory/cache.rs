use crate::cache::CacheBackend;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CachedValue {
    value: Value,
    expires_at: Instant,
}

/// TTL-expiring map standing in for the distributed cache
#[derive(Debug, Clone, Default)]
pub struct LocalCacheBackend {
    entries: Arc<Mutex<HashMap<String, CachedValue>>>,
}

impl LocalCacheBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|v| v.expires_at > now)
            .count()
    }
}

#[async_trait]
impl CacheBackend for LocalCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(cached) if cached.expires_at > Instant::now() => Ok(Some(cached.value.clone())),
            Some(_) => {
                _ = entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<()> {
        let expires_at = Instant::now() + Duration::from_secs(ttl_secs);
        _ = self
            .entries
            .lock()
            .await
            .insert(key.to_string(), CachedValue { value, expires_at });
        Ok(())
    }

    async fn keys_starting_with(&self, prefix: &str) -> Result<Vec<String>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, cached| cached.expires_at > now);
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}
