//! Metadata cache shared by the loaders of one batch
//!
//! A batch is the set of pre-aggregations loaded for one query. Within it,
//! the schema listing, decoded version entries, refresh-key results and the
//! queue stage snapshot are each fetched at most once. Concurrent listing
//! fetches for the same key share a single driver call.

use crate::descriptor::{PreAggregationDescriptor, SqlQuery};
use crate::error::Result;
use crate::orchestrator::PreAggregations;
use crate::query_cache::CacheQueryOptions;
use crate::queue::{QueueStage, StageSnapshot};
use crate::table_name::{VersionEntry, parse_version_entries};
use diagnostics::*;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::Mutex;

type SharedListing = Shared<BoxFuture<'static, Result<Vec<String>>>>;

#[derive(Default)]
struct LoadCacheState {
    // Memo maps are keyed by the listing cache key (local vs external).
    tables: HashMap<String, Vec<String>>,
    version_entries: HashMap<String, Vec<VersionEntry>>,
    fetches: HashMap<String, (u64, SharedListing)>,
    next_fetch_id: u64,
    query_results: HashMap<String, Value>,
    stage_snapshot: Option<StageSnapshot>,
}

pub struct LoadCache {
    orchestrator: PreAggregations,
    state: Mutex<LoadCacheState>,
}

impl LoadCache {
    #[must_use]
    pub fn new(orchestrator: PreAggregations) -> Self {
        Self {
            orchestrator,
            state: Mutex::new(LoadCacheState::default()),
        }
    }

    /// Raw table names of the descriptor's schema, via the shared cache.
    ///
    /// `force_renew` skips the cached value and rewrites it from the driver.
    pub async fn table_listing(
        &self,
        descriptor: &PreAggregationDescriptor,
        force_renew: bool,
    ) -> Result<Vec<String>> {
        let key = self.orchestrator.tables_cache_key(descriptor.external);

        if !force_renew {
            if let Some(cached) = self.orchestrator.cache().get(&key).await? {
                match serde_json::from_value::<Vec<String>>(cached) {
                    Ok(tables) => return Ok(tables),
                    Err(e) => {
                        warn!(
                            "Ignoring malformed table listing under {listing_key}: {reason}",
                            listing_key: key.as_str(),
                            reason: e.to_string()
                        );
                    }
                }
            }
        }

        let (fetch_id, fetch) = {
            let mut state = self.state.lock().await;
            match state.fetches.get(&key) {
                Some((id, fetch)) => (*id, fetch.clone()),
                None => {
                    state.next_fetch_id += 1;
                    let id = state.next_fetch_id;
                    let fetch = fetch_tables(
                        self.orchestrator.clone(),
                        descriptor.clone(),
                        key.clone(),
                    )
                    .boxed()
                    .shared();
                    _ = state.fetches.insert(key.clone(), (id, fetch.clone()));
                    (id, fetch)
                }
            }
        };

        let result = fetch.await;

        let mut state = self.state.lock().await;
        if state.fetches.get(&key).is_some_and(|(id, _)| *id == fetch_id) {
            _ = state.fetches.remove(&key);
        }
        result
    }

    async fn tables(&self, descriptor: &PreAggregationDescriptor) -> Result<Vec<String>> {
        let key = self.orchestrator.tables_cache_key(descriptor.external);
        if let Some(tables) = self.state.lock().await.tables.get(&key) {
            return Ok(tables.clone());
        }
        let tables = self.table_listing(descriptor, false).await?;
        _ = self
            .state
            .lock()
            .await
            .tables
            .insert(key, tables.clone());
        Ok(tables)
    }

    /// Decoded builds in the descriptor's schema, newest first
    pub async fn version_entries(
        &self,
        descriptor: &PreAggregationDescriptor,
    ) -> Result<Vec<VersionEntry>> {
        let key = self.orchestrator.tables_cache_key(descriptor.external);
        if let Some(entries) = self.state.lock().await.version_entries.get(&key) {
            return Ok(entries.clone());
        }
        let tables = self.tables(descriptor).await?;
        let entries = parse_version_entries(&descriptor.pre_aggregations_schema, &tables);
        _ = self
            .state
            .lock()
            .await
            .version_entries
            .insert(key, entries.clone());
        Ok(entries)
    }

    /// Current value of one refresh-key query, evaluated once per batch
    pub async fn key_query_result(
        &self,
        key_query: &SqlQuery,
        wait_for_renew: bool,
        priority: i64,
        renewal_threshold: Option<u64>,
    ) -> Result<Value> {
        let query_cache = self.orchestrator.query_cache();
        let cache_key = query_cache.query_cache_key(key_query);
        if let Some(value) = self.state.lock().await.query_results.get(&cache_key) {
            return Ok(value.clone());
        }

        let options = self.orchestrator.options();
        let key_value = serde_json::to_value(key_query)?;
        let value = query_cache
            .cache_query_result(
                key_query.sql(),
                key_query.params(),
                key_value.clone(),
                options.key_query_expire,
                CacheQueryOptions {
                    renewal_threshold: options.renewal_threshold(renewal_threshold),
                    renewal_key: key_value,
                    wait_for_renew,
                    priority,
                },
            )
            .await?;

        _ = self
            .state
            .lock()
            .await
            .query_results
            .insert(cache_key, value.clone());
        Ok(value)
    }

    pub async fn has_key_query_result(&self, key_query: &SqlQuery) -> bool {
        let cache_key = self.orchestrator.query_cache().query_cache_key(key_query);
        self.state.lock().await.query_results.contains_key(&cache_key)
    }

    /// In-flight queue work for `stage_key`, from a snapshot taken once per batch
    pub async fn queue_stage(&self, stage_key: &str) -> Result<Option<QueueStage>> {
        let queue = self.orchestrator.queue();
        let cached = self.state.lock().await.stage_snapshot.clone();
        let snapshot = match cached {
            Some(snapshot) => snapshot,
            None => {
                let snapshot = queue.fetch_stage_snapshot().await?;
                self.state.lock().await.stage_snapshot = Some(snapshot.clone());
                snapshot
            }
        };
        Ok(queue.lookup_stage(stage_key, &snapshot))
    }

    /// Drop memoized metadata and reload the listing from the driver.
    ///
    /// Refresh-key results are kept: they describe the batch's point in
    /// time, and re-evaluating them mid-batch would move the content version
    /// under loaders that already computed it.
    pub async fn reset(&self, descriptor: &PreAggregationDescriptor) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            state.tables.clear();
            state.version_entries.clear();
            state.stage_snapshot = None;
        }
        let tables = self.table_listing(descriptor, true).await?;
        let key = self.orchestrator.tables_cache_key(descriptor.external);
        _ = self.state.lock().await.tables.insert(key, tables);
        Ok(())
    }
}

async fn fetch_tables(
    orchestrator: PreAggregations,
    descriptor: PreAggregationDescriptor,
    key: String,
) -> Result<Vec<String>> {
    let driver = orchestrator.driver_for(&descriptor).await?;
    let schema = descriptor.pre_aggregations_schema.as_str();
    let tables = driver.list_tables(schema).await?;
    debug!("Fetched {count} tables from {schema}", count: tables.len(), schema: schema);
    orchestrator
        .cache()
        .set(
            &key,
            serde_json::to_value(&tables)?,
            orchestrator.options().pre_aggregations_schema_cache_expire,
        )
        .await?;
    Ok(tables)
}
