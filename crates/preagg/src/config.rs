//! Orchestrator configuration
//!
//! All fields have defaults; a YAML document only names what it overrides:
//!
//! ```yaml
//! redis_prefix: "prod"
//! refresh_key_renewal_threshold: 30
//! queue:
//!   continue_wait_timeout_secs: 5
//! ```

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorOptions {
    /// Namespace for every cache key written by one orchestrator
    pub redis_prefix: String,
    /// TTL of cached schema listings, seconds
    pub pre_aggregations_schema_cache_expire: u64,
    /// TTL of a tables-used marker, seconds; refreshed on every reference
    pub tables_used_expire: u64,
    /// TTL of cached refresh-key results, seconds
    pub key_query_expire: u64,
    /// Renewal threshold used when a key query has none of its own, seconds
    pub default_refresh_key_renewal_threshold: u64,
    /// Overrides every per-key renewal threshold when set
    pub refresh_key_renewal_threshold: Option<u64>,
    /// Failures tolerated per (table, content version) before refreshes stop
    pub circuit_breaker_threshold: u32,
    /// Priority of builds from scratch and structural rebuilds
    pub default_priority: i64,
    /// Priority of content-only refreshes
    pub content_refresh_priority: i64,
    pub queue: QueueOptions,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            redis_prefix: String::new(),
            pre_aggregations_schema_cache_expire: 60 * 60,
            tables_used_expire: 600,
            key_query_expire: 60 * 60,
            default_refresh_key_renewal_threshold: 2 * 60,
            refresh_key_renewal_threshold: None,
            circuit_breaker_threshold: 10,
            default_priority: 10,
            content_refresh_priority: 0,
            queue: QueueOptions::default(),
        }
    }
}

impl OrchestratorOptions {
    pub fn with_prefix<S: Into<String>>(prefix: S) -> Self {
        Self {
            redis_prefix: prefix.into(),
            ..Self::default()
        }
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml_ng::from_str(text)?)
    }

    /// Threshold for one key query: global override, then per-key, then default
    #[must_use]
    pub fn renewal_threshold(&self, per_key: Option<u64>) -> u64 {
        self.refresh_key_renewal_threshold
            .or(per_key)
            .unwrap_or(self.default_refresh_key_renewal_threshold)
    }
}

/// Settings for the rebuild queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    /// Concurrently executing rebuilds
    pub concurrency: usize,
    /// How long a caller waits before receiving the continue-wait signal
    pub continue_wait_timeout_secs: Option<u64>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            continue_wait_timeout_secs: None,
        }
    }
}

impl QueueOptions {
    #[must_use]
    pub fn continue_wait_timeout(&self) -> Option<Duration> {
        self.continue_wait_timeout_secs.map(Duration::from_secs)
    }
}
