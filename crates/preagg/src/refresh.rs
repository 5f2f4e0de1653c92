//! Materialization of one pre-aggregation build
//!
//! A [`Refresh`] runs inside the rebuild queue. It picks a strategy from the
//! descriptor and the source driver's capabilities:
//!
//! * [`RefreshStrategy::StoreInSource`] builds the table in the source engine.
//! * [`RefreshStrategy::TempTableExternal`] builds in the source, downloads
//!   the rows and uploads them to the external store.
//! * [`RefreshStrategy::StreamExternal`] streams a query from a read-only
//!   source straight into the external store.
//!
//! A build becomes visible to loaders only through the schema listing, after
//! its data and indexes are in place.

use crate::descriptor::PreAggregationDescriptor;
use crate::driver::{DownloadedTable, Driver, DriverCapabilities};
use crate::error::{Error, Result};
use crate::load_cache::LoadCache;
use crate::orchestrator::PreAggregations;
use crate::orphans::drop_orphaned_tables;
use crate::table_name::VersionEntry;
use diagnostics::*;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStrategy {
    StoreInSource,
    TempTableExternal,
    StreamExternal,
}

impl RefreshStrategy {
    #[must_use]
    pub fn select(external: bool, source: DriverCapabilities) -> Self {
        match (external, source.read_only) {
            (false, _) => RefreshStrategy::StoreInSource,
            (true, true) => RefreshStrategy::StreamExternal,
            (true, false) => RefreshStrategy::TempTableExternal,
        }
    }
}

/// Replace logical table names in `sql` with physical ones.
///
/// Scans left to right and substitutes the longest logical name starting at
/// each position, so a name that prefixes another (`s.orders` and
/// `s.orders_idx`) never rewrites text already substituted.
#[must_use]
pub fn substitute_table_names(sql: &str, mappings: &[(String, String)]) -> String {
    let mut names: Vec<&(String, String)> = mappings.iter().filter(|(from, _)| !from.is_empty()).collect();
    names.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

    let mut result = String::with_capacity(sql.len());
    let mut rest = sql;
    while let Some(ch) = rest.chars().next() {
        match names.iter().find(|(from, _)| rest.starts_with(from.as_str())) {
            Some((from, to)) => {
                result.push_str(to);
                rest = &rest[from.len()..];
            }
            None => {
                result.push(ch);
                rest = &rest[ch.len_utf8()..];
            }
        }
    }
    result
}

/// One queued rebuild
pub(crate) struct Refresh {
    orchestrator: PreAggregations,
    descriptor: Arc<PreAggregationDescriptor>,
    resolved_tables: Arc<Vec<(String, String)>>,
    new_entry: VersionEntry,
    request_id: Arc<str>,
    load_cache: LoadCache,
}

impl Refresh {
    pub(crate) fn new(
        orchestrator: PreAggregations,
        descriptor: Arc<PreAggregationDescriptor>,
        resolved_tables: Arc<Vec<(String, String)>>,
        new_entry: VersionEntry,
        request_id: Arc<str>,
    ) -> Self {
        // Queued work never shares metadata with the batch that enqueued it.
        let load_cache = LoadCache::new(orchestrator.clone());
        Self {
            orchestrator,
            descriptor,
            resolved_tables,
            new_entry,
            request_id,
            load_cache,
        }
    }

    pub(crate) async fn run(self) -> Result<()> {
        let source = self.orchestrator.source_driver().await?;
        let capabilities = source.capabilities();
        let strategy = RefreshStrategy::select(self.descriptor.external, capabilities);
        debug!(
            "Building {target} with {strategy} ({request_id})",
            target: self.target_table_name(),
            strategy: format!("{strategy:?}"),
            request_id: &*self.request_id
        );
        match strategy {
            RefreshStrategy::StoreInSource => self.store_in_source(source.as_ref()).await,
            RefreshStrategy::TempTableExternal => {
                self.temp_table_external(source.as_ref(), capabilities).await
            }
            RefreshStrategy::StreamExternal => {
                self.stream_external(source.as_ref(), capabilities).await
            }
        }
    }

    fn target_table_name(&self) -> String {
        self.new_entry.target_table_name()
    }

    /// Load SQL with resolved rollups and the table's own name substituted
    fn load_sql(&self) -> String {
        let mut mappings = self.resolved_tables.as_ref().clone();
        mappings.push((self.descriptor.table_name.clone(), self.target_table_name()));
        substitute_table_names(self.descriptor.load_sql.sql(), &mappings)
    }

    async fn store_in_source(&self, source: &dyn Driver) -> Result<()> {
        let target = self.target_table_name();
        source
            .load_pre_aggregation_into_table(&target, &self.load_sql(), self.descriptor.load_sql.params())
            .await?;
        self.create_indexes(source).await?;
        self.load_cache.reset(&self.descriptor).await?;
        self.collect_orphans(source, &target).await?;
        self.load_cache.reset(&self.descriptor).await
    }

    async fn temp_table_external(
        &self,
        source: &dyn Driver,
        capabilities: DriverCapabilities,
    ) -> Result<()> {
        let target = self.target_table_name();
        source
            .create_schema_if_not_exists(&self.descriptor.pre_aggregations_schema)
            .await?;
        source
            .load_pre_aggregation_into_table(&target, &self.load_sql(), self.descriptor.load_sql.params())
            .await?;
        let table = self.download_temp_table(source, capabilities).await?;
        self.upload_external(table).await?;
        self.load_cache.reset(&self.descriptor).await?;
        // The holding table in the source is collected once its marker expires.
        self.collect_orphans(source, &target).await
    }

    async fn stream_external(
        &self,
        source: &dyn Driver,
        capabilities: DriverCapabilities,
    ) -> Result<()> {
        if !capabilities.download_query_results {
            return Err(Error::capability(
                "source driver doesn't support downloadQueryResults()",
            ));
        }
        info!(
            "Downloading external pre-aggregation via query {table_name} ({request_id})",
            table_name: self.descriptor.table_name.as_str(),
            request_id: &*self.request_id
        );
        let select = self.descriptor.select_sql();
        let sql = substitute_table_names(select.sql(), &self.resolved_tables);
        let table = source.download_query_results(&sql, select.params()).await?;
        self.upload_external(table).await
    }

    async fn download_temp_table(
        &self,
        source: &dyn Driver,
        capabilities: DriverCapabilities,
    ) -> Result<DownloadedTable> {
        if !capabilities.download_table {
            return Err(Error::capability(
                "source driver doesn't support downloadTable()",
            ));
        }
        let target = self.target_table_name();
        info!(
            "Downloading external pre-aggregation {table_name} ({request_id})",
            table_name: self.descriptor.table_name.as_str(),
            request_id: &*self.request_id
        );
        let data = source.download_table(&target).await?;
        let types = source.table_column_types(&target).await?;
        Ok(DownloadedTable { types, data })
    }

    async fn upload_external(&self, table: DownloadedTable) -> Result<()> {
        let external = self.orchestrator.external_driver().await?;
        if !external.capabilities().upload_table {
            return Err(Error::capability(
                "destination driver doesn't support uploadTable()",
            ));
        }
        let target = self.target_table_name();
        info!(
            "Uploading external pre-aggregation {table_name} ({request_id})",
            table_name: self.descriptor.table_name.as_str(),
            request_id: &*self.request_id
        );
        external.upload_table(&target, &table.types, table.data).await?;
        self.create_indexes(external.as_ref()).await?;
        self.load_cache.reset(&self.descriptor).await?;
        self.collect_orphans(external.as_ref(), &target).await
    }

    async fn create_indexes(&self, driver: &dyn Driver) -> Result<()> {
        let target = self.target_table_name();
        for index in &self.descriptor.indexes_sql {
            let index_target = self.new_entry.with_table_name(&index.index_name).target_table_name();
            let mut mappings = self.resolved_tables.as_ref().clone();
            mappings.push((self.descriptor.table_name.clone(), target.clone()));
            mappings.push((index.index_name.clone(), index_target));

            info!(
                "Creating pre-aggregation index {index_name} ({request_id})",
                index_name: index.index_name.as_str(),
                request_id: &*self.request_id
            );
            let sql = substitute_table_names(index.sql.sql(), &mappings);
            _ = driver.query(&sql, index.sql.params()).await?;
        }
        Ok(())
    }

    async fn collect_orphans(&self, driver: &dyn Driver, just_created: &str) -> Result<()> {
        _ = drop_orphaned_tables(
            &self.orchestrator,
            driver,
            &self.descriptor.pre_aggregations_schema,
            just_created,
            &self.request_id,
        )
        .await?;
        Ok(())
    }
}
