//! Driver interface consumed by the loader and refresh strategies
//!
//! A driver executes SQL against one storage engine: the source query
//! engine, or the external store that serves external pre-aggregations.
//! Optional transfer operations are advertised through
//! [`DriverCapabilities`] and default to a capability error.

use crate::error::{Error, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Column name and engine type of a downloaded table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnType {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
}

impl ColumnType {
    pub fn new<N: Into<String>, T: Into<String>>(name: N, data_type: T) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
        }
    }
}

pub type Row = serde_json::Map<String, Value>;

/// Rows moving between drivers
pub enum TableData {
    /// Fully downloaded rows
    Rows(Vec<Row>),
    /// Rows streamed from a query without an intermediate table
    Stream(BoxStream<'static, Result<Row>>),
}

impl std::fmt::Debug for TableData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableData::Rows(rows) => f.debug_tuple("Rows").field(&rows.len()).finish(),
            TableData::Stream(_) => f.write_str("Stream(<rows>)"),
        }
    }
}

/// Rows plus the column types needed to recreate them elsewhere
#[derive(Debug)]
pub struct DownloadedTable {
    pub types: Vec<ColumnType>,
    pub data: TableData,
}

/// What a driver can do beyond plain SQL execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCapabilities {
    /// Cannot hold intermediate tables; external builds must stream
    pub read_only: bool,
    pub download_table: bool,
    pub download_query_results: bool,
    pub upload_table: bool,
}

#[async_trait]
pub trait Driver: Send + Sync {
    fn capabilities(&self) -> DriverCapabilities;

    /// Raw (unqualified) names of every table in `schema`
    async fn list_tables(&self, schema: &str) -> Result<Vec<String>>;

    async fn create_schema_if_not_exists(&self, schema: &str) -> Result<()>;

    /// Materialize `sql` into `table`
    async fn load_pre_aggregation_into_table(
        &self,
        table: &str,
        sql: &str,
        params: &[Value],
    ) -> Result<()>;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>>;

    /// `table` is schema-qualified
    async fn drop_table(&self, table: &str) -> Result<()>;

    async fn table_column_types(&self, table: &str) -> Result<Vec<ColumnType>>;

    async fn download_table(&self, _table: &str) -> Result<TableData> {
        Err(Error::capability(
            "source driver doesn't support downloadTable()",
        ))
    }

    async fn download_query_results(
        &self,
        _sql: &str,
        _params: &[Value],
    ) -> Result<DownloadedTable> {
        Err(Error::capability(
            "source driver doesn't support downloadQueryResults()",
        ))
    }

    async fn upload_table(
        &self,
        _table: &str,
        _types: &[ColumnType],
        _data: TableData,
    ) -> Result<()> {
        Err(Error::capability(
            "destination driver doesn't support uploadTable()",
        ))
    }
}

/// Produces a connected driver on demand
pub type DriverFactory = Arc<dyn Fn() -> BoxFuture<'static, Result<Arc<dyn Driver>>> + Send + Sync>;

/// Factory that always hands out the same driver
pub fn shared_driver_factory(driver: Arc<dyn Driver>) -> DriverFactory {
    Arc::new(move || {
        let driver = driver.clone();
        Box::pin(async move { Ok(driver) })
    })
}
