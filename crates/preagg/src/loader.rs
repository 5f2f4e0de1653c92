//! Per-pre-aggregation refresh decisions
//!
//! A [`Loader`] answers one question: which physical build of this
//! pre-aggregation should the current query read? Depending on what the
//! schema holds and what the refresh keys say, it serves an existing build,
//! blocks on a rebuild, or serves a stale build while a rebuild runs in the
//! background.

use crate::descriptor::{LoadResult, PreAggregationDescriptor};
use crate::error::{Error, Result};
use crate::load_cache::LoadCache;
use crate::orchestrator::PreAggregations;
use crate::queue::QueueRequest;
use crate::refresh::Refresh;
use crate::table_name::VersionEntry;
use crate::version::version;
use diagnostics::*;
use futures::FutureExt;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Default)]
pub struct LoaderOptions {
    /// Block until stale content has been rebuilt
    pub wait_for_renew: bool,
    /// Correlates log lines of one query
    pub request_id: String,
}

/// Decision engine for one pre-aggregation within one batch
#[derive(Clone)]
pub struct Loader {
    orchestrator: PreAggregations,
    descriptor: Arc<PreAggregationDescriptor>,
    load_cache: Arc<LoadCache>,
    /// (logical name, physical name) of pre-aggregations resolved earlier in the batch
    resolved_tables: Arc<Vec<(String, String)>>,
    wait_for_renew: bool,
    request_id: Arc<str>,
}

impl Loader {
    pub(crate) fn new(
        orchestrator: PreAggregations,
        descriptor: PreAggregationDescriptor,
        load_cache: Arc<LoadCache>,
        resolved_tables: Vec<(String, String)>,
        options: LoaderOptions,
    ) -> Self {
        Self {
            orchestrator,
            descriptor: Arc::new(descriptor),
            load_cache,
            resolved_tables: Arc::new(resolved_tables),
            wait_for_renew: options.wait_for_renew,
            request_id: Arc::from(options.request_id),
        }
    }

    #[must_use]
    pub fn descriptor(&self) -> &PreAggregationDescriptor {
        &self.descriptor
    }

    /// Choose the build to serve.
    ///
    /// When some refresh key has not been evaluated yet in this batch and the
    /// caller does not insist on fresh data, any build with the current
    /// structure is served immediately and full resolution continues in the
    /// background. Otherwise resolution runs inline and the result carries
    /// the refresh-key values it was computed from.
    pub async fn load(&self) -> Result<LoadResult> {
        if !self.wait_for_renew && self.has_unloaded_key_query().await {
            let structure_version = self.structure_version()?;

            let started = Instant::now();
            let entries = self.load_cache.version_entries(&self.descriptor).await?;
            let duration_ms = started.elapsed().as_millis() as u64;
            debug!(
                "Load PreAggregations Tables {table_name} in {duration_ms} ms ({request_id})",
                table_name: self.descriptor.table_name.as_str(),
                duration_ms: duration_ms,
                request_id: &*self.request_id
            );

            if let Some(entry) = entries
                .iter()
                .find(|e| e.table_name == self.descriptor.table_name && e.structure_version == structure_version)
            {
                self.spawn_background_resolve();
                return Ok(LoadResult::Resolved {
                    table_name: entry.target_table_name(),
                });
            }
            return Ok(LoadResult::Resolved {
                table_name: self.resolve_until_done().await?,
            });
        }

        let table_name = self.resolve_until_done().await?;
        let refresh_key_values = self.invalidation_key_values().await?;
        Ok(LoadResult::ResolvedWithKeys {
            table_name,
            refresh_key_values,
        })
    }

    /// Resolve, re-attempting while the queue asks the caller to keep waiting
    async fn resolve_until_done(&self) -> Result<String> {
        loop {
            match self.resolve().await {
                Err(e) if e.is_continue_wait() => {
                    debug!(
                        "Still waiting for {table_name}, resolving again",
                        table_name: self.descriptor.table_name.as_str()
                    );
                    self.load_cache.reset(&self.descriptor).await?;
                }
                other => return other,
            }
        }
    }

    /// Full content-aware resolution; returns the physical table name
    pub async fn resolve(&self) -> Result<String> {
        let invalidation_keys = self.invalidation_key_values().await?;
        let content_version = self.content_version(&invalidation_keys)?;
        let structure_version = self.structure_version()?;

        let entries = self.load_cache.version_entries(&self.descriptor).await?;
        let table_name = self.descriptor.table_name.as_str();
        let request_id = &*self.request_id;

        if let Some(entry) = find_entry(&entries, table_name, |e| e.content_version == content_version) {
            return Ok(entry.target_table_name());
        }

        if !self.wait_for_renew
            && self
                .load_cache
                .queue_stage(self.descriptor.stage_key())
                .await?
                .is_some()
        {
            if let Some(entry) = find_entry(&entries, table_name, |e| e.structure_version == structure_version) {
                debug!(
                    "Rebuild of {table_name} already queued, serving previous build ({request_id})",
                    table_name: table_name,
                    request_id: request_id
                );
                return Ok(entry.target_table_name());
            }
        }

        if entries.is_empty() {
            let driver = self.orchestrator.driver_for(&self.descriptor).await?;
            driver
                .create_schema_if_not_exists(&self.descriptor.pre_aggregations_schema)
                .await?;
        }

        let new_entry = VersionEntry {
            table_name: self.descriptor.table_name.clone(),
            content_version,
            structure_version,
            last_updated_at: chrono::Utc::now().timestamp_millis(),
        };
        let options = self.orchestrator.options();

        let Some(existing) = find_entry(&entries, table_name, |_| true) else {
            info!(
                "Creating pre-aggregation from scratch {table_name} ({request_id})",
                table_name: table_name,
                request_id: request_id
            );
            let priority = self.descriptor.priority_or(options.default_priority);
            self.execute_in_queue(&invalidation_keys, priority, &new_entry).await?;
            return self.most_recent_target_table_name(&new_entry).await;
        };

        if existing.structure_version != new_entry.structure_version {
            info!(
                "Invalidating pre-aggregation structure {table_name} ({request_id})",
                table_name: table_name,
                request_id: request_id
            );
            let priority = self.descriptor.priority_or(options.default_priority);
            self.execute_in_queue(&invalidation_keys, priority, &new_entry).await?;
            return self.most_recent_target_table_name(&new_entry).await;
        }

        if existing.content_version != new_entry.content_version {
            let priority = self.descriptor.priority_or(options.content_refresh_priority);
            if self.wait_for_renew {
                info!(
                    "Waiting for pre-aggregation renew {table_name} ({request_id})",
                    table_name: table_name,
                    request_id: request_id
                );
                self.execute_in_queue(&invalidation_keys, priority, &new_entry).await?;
                return self.most_recent_target_table_name(&new_entry).await;
            }

            if let Some(record) = self
                .orchestrator
                .refresh_errors()
                .get(&new_entry.table_name, &new_entry.content_version)
                .await
            {
                if record.counter > options.circuit_breaker_threshold {
                    return Err(record.error);
                }
            }
            self.schedule_refresh(invalidation_keys, priority, new_entry);
        }

        Ok(existing.target_table_name())
    }

    async fn has_unloaded_key_query(&self) -> bool {
        for key_query in &self.descriptor.invalidate_key_queries {
            if !self.load_cache.has_key_query_result(key_query).await {
                return true;
            }
        }
        false
    }

    /// Refresh-key values in declared order
    async fn invalidation_key_values(&self) -> Result<Vec<Value>> {
        let priority = self
            .descriptor
            .priority_or(self.orchestrator.options().default_priority);
        let lookups = self
            .descriptor
            .invalidate_key_queries
            .iter()
            .enumerate()
            .map(|(i, key_query)| {
                self.load_cache.key_query_result(
                    key_query,
                    self.wait_for_renew,
                    priority,
                    self.descriptor.renewal_threshold(i),
                )
            });
        futures::future::try_join_all(lookups).await
    }

    /// Tag of the definition plus the data it was built from
    pub fn content_version(&self, invalidation_keys: &[Value]) -> Result<String> {
        let d = &self.descriptor;
        if d.indexes_sql.is_empty() {
            version(&(&d.load_sql, invalidation_keys))
        } else {
            version(&(&d.load_sql, &d.indexes_sql, invalidation_keys))
        }
    }

    /// Tag of the definition alone
    pub fn structure_version(&self) -> Result<String> {
        let d = &self.descriptor;
        if d.indexes_sql.is_empty() {
            version(&d.load_sql)
        } else {
            version(&(&d.load_sql, &d.indexes_sql))
        }
    }

    /// Run a rebuild through the queue and wait for it
    async fn execute_in_queue(
        &self,
        invalidation_keys: &[Value],
        priority: i64,
        new_entry: &VersionEntry,
    ) -> Result<()> {
        let request = QueueRequest {
            job_type: "query".to_string(),
            query_key: json!([self.descriptor.load_sql, invalidation_keys]),
            stage_key: self.descriptor.stage_key().to_string(),
            priority,
            request_id: self.request_id.to_string(),
        };
        let job = Refresh::new(
            self.orchestrator.clone(),
            self.descriptor.clone(),
            self.resolved_tables.clone(),
            new_entry.clone(),
            self.request_id.clone(),
        )
        .run()
        .boxed();
        self.orchestrator
            .queue()
            .execute_in_queue(request, job)
            .await
            .inspect_err(|e| {
                if !e.is_continue_wait() {
                    error!(
                        "Error refreshing pre-aggregation {table_name} ({request_id}): {reason}",
                        table_name: self.descriptor.table_name.as_str(),
                        request_id: &*self.request_id,
                        reason: e.to_string()
                    );
                }
            })
    }

    /// The build just produced by the queue, read back from a fresh listing
    async fn most_recent_target_table_name(&self, new_entry: &VersionEntry) -> Result<String> {
        self.load_cache.reset(&self.descriptor).await?;
        let entries = self.load_cache.version_entries(&self.descriptor).await?;
        find_entry(&entries, &self.descriptor.table_name, |e| {
            e.content_version == new_entry.content_version
        })
        .map(VersionEntry::target_table_name)
        .ok_or_else(|| Error::TableNotFoundAfterBuild {
            table_name: self.descriptor.table_name.clone(),
        })
    }

    /// Rebuild stale content in the background; the caller keeps the old build
    fn schedule_refresh(&self, invalidation_keys: Vec<Value>, priority: i64, new_entry: VersionEntry) {
        info!(
            "Refreshing pre-aggregation content {table_name} ({request_id})",
            table_name: self.descriptor.table_name.as_str(),
            request_id: &*self.request_id
        );
        let loader = self.clone();
        self.orchestrator.spawn(async move {
            let errors = loader.orchestrator.refresh_errors();
            match loader
                .execute_in_queue(&invalidation_keys, priority, &new_entry)
                .await
            {
                Ok(()) => errors.clear(&new_entry.table_name).await,
                Err(e) if e.is_continue_wait() => {}
                Err(e) => {
                    let counter = errors
                        .record_failure(&new_entry.table_name, &new_entry.content_version, e)
                        .await;
                    warn!(
                        "Background refresh of {table_name} failed {counter} times ({request_id})",
                        table_name: new_entry.table_name.as_str(),
                        counter: counter,
                        request_id: &*loader.request_id
                    );
                }
            }
        });
    }

    /// Full resolution detached from the caller, errors go to the log
    fn spawn_background_resolve(&self) {
        let loader = self.clone();
        self.orchestrator.spawn(async move {
            if let Err(e) = loader.resolve().await {
                if !e.is_continue_wait() {
                    error!(
                        "Error loading pre-aggregation {table_name} ({request_id}): {reason}",
                        table_name: loader.descriptor.table_name.as_str(),
                        request_id: &*loader.request_id,
                        reason: e.to_string()
                    );
                }
            }
        });
    }
}

fn find_entry<'a, P>(entries: &'a [VersionEntry], table_name: &str, predicate: P) -> Option<&'a VersionEntry>
where
    P: Fn(&VersionEntry) -> bool,
{
    entries
        .iter()
        .find(|e| e.table_name == table_name && predicate(e))
}
