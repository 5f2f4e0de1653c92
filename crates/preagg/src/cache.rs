//! Key-value cache shared by every orchestrator process
//!
//! Holds schema listings and tables-used markers. Values are JSON; every
//! write carries a TTL.

use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl_secs: u64) -> Result<()>;

    /// Live keys beginning with `prefix`
    async fn keys_starting_with(&self, prefix: &str) -> Result<Vec<String>>;
}
