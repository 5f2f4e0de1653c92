//! Registries owned by one orchestrator
//!
//! [`RefreshErrors`] counts background refresh failures per
//! (table, content version) and feeds the circuit breaker. It is in-memory:
//! losing it on restart only lets a failing refresh be retried again.
//!
//! [`TablesUsed`] marks physical tables referenced by in-flight loads in the
//! shared cache so orphan collection in any process leaves them alone.

use crate::cache::CacheBackend;
use crate::error::{Error, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Last failure and consecutive failure count for one refresh target
#[derive(Debug, Clone)]
pub struct RefreshErrorRecord {
    pub error: Error,
    pub counter: u32,
}

#[derive(Debug, Default)]
pub struct RefreshErrors {
    // table_name -> content_version -> record
    records: Mutex<HashMap<String, HashMap<String, RefreshErrorRecord>>>,
}

impl RefreshErrors {
    pub async fn get(&self, table_name: &str, content_version: &str) -> Option<RefreshErrorRecord> {
        self.records
            .lock()
            .await
            .get(table_name)
            .and_then(|versions| versions.get(content_version))
            .cloned()
    }

    /// Store `error` as the latest failure and return the new count
    pub async fn record_failure(&self, table_name: &str, content_version: &str, error: Error) -> u32 {
        let mut records = self.records.lock().await;
        let record = records
            .entry(table_name.to_string())
            .or_default()
            .entry(content_version.to_string())
            .or_insert(RefreshErrorRecord { error: error.clone(), counter: 0 });
        record.error = error;
        record.counter += 1;
        record.counter
    }

    /// Forget every failure recorded for the table
    pub async fn clear(&self, table_name: &str) {
        _ = self.records.lock().await.remove(table_name);
    }
}

pub struct TablesUsed {
    cache: Arc<dyn CacheBackend>,
    prefix: String,
    expire_secs: u64,
}

impl TablesUsed {
    pub fn new(cache: Arc<dyn CacheBackend>, redis_prefix: &str, expire_secs: u64) -> Self {
        Self {
            cache,
            prefix: format!("SQL_PRE_AGGREGATIONS_{redis_prefix}_TABLES_USED_"),
            expire_secs,
        }
    }

    #[must_use]
    pub fn key(&self, table_name: &str) -> String {
        format!("{}{table_name}", self.prefix)
    }

    /// Mark `table_name` as used, refreshing its TTL
    pub async fn add(&self, table_name: &str) -> Result<()> {
        self.cache
            .set(&self.key(table_name), Value::Bool(true), self.expire_secs)
            .await
    }

    pub async fn list(&self) -> Result<Vec<String>> {
        let keys = self.cache.keys_starting_with(&self.prefix).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&self.prefix).map(str::to_string))
            .collect())
    }
}
