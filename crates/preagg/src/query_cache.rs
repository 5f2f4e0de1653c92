//! Query-result cache used to evaluate refresh-key queries

use crate::descriptor::SqlQuery;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq)]
pub struct CacheQueryOptions {
    /// Age after which a cached result is refreshed, seconds
    pub renewal_threshold: u64,
    pub renewal_key: Value,
    /// Block on the refreshed value instead of serving the cached one
    pub wait_for_renew: bool,
    pub priority: i64,
}

#[async_trait]
pub trait QueryCache: Send + Sync {
    /// Stable identity of a key query, used for per-batch memoization
    fn query_cache_key(&self, key_query: &SqlQuery) -> String {
        serde_json::to_string(key_query).unwrap_or_else(|_| key_query.sql().to_string())
    }

    async fn cache_query_result(
        &self,
        sql: &str,
        params: &[Value],
        cache_key: Value,
        expire_secs: u64,
        options: CacheQueryOptions,
    ) -> Result<Value>;
}
