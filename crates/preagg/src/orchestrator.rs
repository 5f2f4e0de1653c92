//! Orchestrator: entry point for loading the pre-aggregations of a query
//!
//! [`PreAggregations`] owns everything that outlives one batch of loads: the
//! cache backend, the rebuild queue, the refresh-error and tables-used
//! registries, and the tracker of detached background work. It is a cheap
//! handle; load caches, loaders and queued refresh jobs each hold a clone.

use crate::cache::CacheBackend;
use crate::config::OrchestratorOptions;
use crate::descriptor::{PreAggregationDescriptor, QueryBody, UsedPreAggregation};
use crate::driver::{Driver, DriverFactory};
use crate::error::{Error, Result};
use crate::load_cache::LoadCache;
use crate::loader::{Loader, LoaderOptions};
use crate::memory::{LocalCacheBackend, LocalQueue};
use crate::query_cache::QueryCache;
use crate::queue::RebuildQueue;
use crate::registry::{RefreshErrorRecord, RefreshErrors, TablesUsed};
use diagnostics::*;
use std::future::Future;
use std::sync::Arc;
use tokio_util::task::TaskTracker;

struct Inner {
    options: OrchestratorOptions,
    driver_factory: DriverFactory,
    external_driver_factory: Option<DriverFactory>,
    query_cache: Arc<dyn QueryCache>,
    cache: Arc<dyn CacheBackend>,
    queue: Arc<dyn RebuildQueue>,
    refresh_errors: RefreshErrors,
    tables_used: TablesUsed,
    tasks: TaskTracker,
}

#[derive(Clone)]
pub struct PreAggregations {
    inner: Arc<Inner>,
}

/// Builder for [`PreAggregations`]
///
/// Without explicit collaborators the orchestrator runs on a
/// [`LocalCacheBackend`] and a [`LocalQueue`] built from the queue options.
pub struct PreAggregationsBuilder {
    options: OrchestratorOptions,
    driver_factory: DriverFactory,
    external_driver_factory: Option<DriverFactory>,
    query_cache: Arc<dyn QueryCache>,
    cache: Option<Arc<dyn CacheBackend>>,
    queue: Option<Arc<dyn RebuildQueue>>,
}

impl PreAggregationsBuilder {
    #[must_use]
    pub fn options(mut self, options: OrchestratorOptions) -> Self {
        self.options = options;
        self
    }

    #[must_use]
    pub fn external_driver_factory(mut self, factory: DriverFactory) -> Self {
        self.external_driver_factory = Some(factory);
        self
    }

    #[must_use]
    pub fn cache_backend(mut self, cache: Arc<dyn CacheBackend>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use]
    pub fn queue(mut self, queue: Arc<dyn RebuildQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    #[must_use]
    pub fn build(self) -> PreAggregations {
        let cache = self
            .cache
            .unwrap_or_else(|| Arc::new(LocalCacheBackend::new()));
        let queue = self
            .queue
            .unwrap_or_else(|| Arc::new(LocalQueue::new(&self.options.queue)));
        let tables_used = TablesUsed::new(
            cache.clone(),
            &self.options.redis_prefix,
            self.options.tables_used_expire,
        );
        PreAggregations {
            inner: Arc::new(Inner {
                options: self.options,
                driver_factory: self.driver_factory,
                external_driver_factory: self.external_driver_factory,
                query_cache: self.query_cache,
                cache,
                queue,
                refresh_errors: RefreshErrors::default(),
                tables_used,
                tasks: TaskTracker::new(),
            }),
        }
    }
}

impl PreAggregations {
    pub fn builder(
        driver_factory: DriverFactory,
        query_cache: Arc<dyn QueryCache>,
    ) -> PreAggregationsBuilder {
        PreAggregationsBuilder {
            options: OrchestratorOptions::default(),
            driver_factory,
            external_driver_factory: None,
            query_cache,
            cache: None,
            queue: None,
        }
    }

    /// Resolve every pre-aggregation of one query, in declared order.
    ///
    /// All loads share one [`LoadCache`]. Each loader sees the physical names
    /// already chosen for the pre-aggregations before it, so materialization
    /// SQL that reads an earlier rollup is rewritten to the resolved build.
    pub async fn load_all_pre_aggregations_if_needed(
        &self,
        query_body: QueryBody,
    ) -> Result<Vec<UsedPreAggregation>> {
        let request_id = query_body
            .request_id
            .unwrap_or_else(|| uuid7::uuid7().to_string());
        let load_cache = self.load_cache();
        let options = LoaderOptions {
            wait_for_renew: query_body.renew_query,
            request_id,
        };

        let mut used: Vec<UsedPreAggregation> = Vec::with_capacity(query_body.pre_aggregations.len());
        for descriptor in query_body.pre_aggregations {
            let resolved_tables: Vec<(String, String)> = used
                .iter()
                .map(|u| (u.table_name.clone(), u.result.target_table_name().to_string()))
                .collect();
            let loader = self.loader(descriptor, load_cache.clone(), resolved_tables, options.clone());
            let result = loader.load().await?;
            self.add_table_used(result.target_table_name()).await?;
            used.push(UsedPreAggregation {
                table_name: loader.descriptor().table_name.clone(),
                result,
            });
        }
        Ok(used)
    }

    /// Fresh per-batch metadata cache
    #[must_use]
    pub fn load_cache(&self) -> Arc<LoadCache> {
        Arc::new(LoadCache::new(self.clone()))
    }

    #[must_use]
    pub fn loader(
        &self,
        descriptor: PreAggregationDescriptor,
        load_cache: Arc<LoadCache>,
        resolved_tables: Vec<(String, String)>,
        options: LoaderOptions,
    ) -> Loader {
        Loader::new(self.clone(), descriptor, load_cache, resolved_tables, options)
    }

    /// Protect a physical table from orphan collection for the marker TTL
    pub async fn add_table_used(&self, table_name: &str) -> Result<()> {
        self.inner.tables_used.add(table_name).await
    }

    pub async fn tables_used(&self) -> Result<Vec<String>> {
        self.inner.tables_used.list().await
    }

    pub async fn refresh_error(
        &self,
        table_name: &str,
        content_version: &str,
    ) -> Option<RefreshErrorRecord> {
        self.inner.refresh_errors.get(table_name, content_version).await
    }

    /// Wait until every detached resolution and refresh has finished
    pub async fn wait_for_background_tasks(&self) {
        let tasks = &self.inner.tasks;
        tasks.close();
        tasks.wait().await;
        _ = tasks.reopen();
    }

    #[must_use]
    pub fn options(&self) -> &OrchestratorOptions {
        &self.inner.options
    }

    pub(crate) fn cache(&self) -> &Arc<dyn CacheBackend> {
        &self.inner.cache
    }

    pub(crate) fn queue(&self) -> &Arc<dyn RebuildQueue> {
        &self.inner.queue
    }

    pub(crate) fn query_cache(&self) -> &Arc<dyn QueryCache> {
        &self.inner.query_cache
    }

    pub(crate) fn refresh_errors(&self) -> &RefreshErrors {
        &self.inner.refresh_errors
    }

    pub(crate) async fn source_driver(&self) -> Result<Arc<dyn Driver>> {
        (self.inner.driver_factory)().await
    }

    pub(crate) async fn external_driver(&self) -> Result<Arc<dyn Driver>> {
        match &self.inner.external_driver_factory {
            Some(factory) => factory().await,
            None => Err(Error::configuration(
                "externalDriverFactory should be set in order to use external pre-aggregations",
            )),
        }
    }

    /// Driver that stores the descriptor's physical tables
    pub(crate) async fn driver_for(
        &self,
        descriptor: &PreAggregationDescriptor,
    ) -> Result<Arc<dyn Driver>> {
        if descriptor.external {
            self.external_driver().await
        } else {
            self.source_driver().await
        }
    }

    /// Cache key of the schema listing for local or external tables
    pub(crate) fn tables_cache_key(&self, external: bool) -> String {
        format!(
            "SQL_PRE_AGGREGATIONS_TABLES_{}{}",
            self.inner.options.redis_prefix,
            if external { "_EXT" } else { "" }
        )
    }

    /// Run detached work whose completion is still observable
    pub(crate) fn spawn<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        debug!("Spawning background task, {pending} already pending", pending: self.inner.tasks.len());
        _ = self.inner.tasks.spawn(task);
    }
}
