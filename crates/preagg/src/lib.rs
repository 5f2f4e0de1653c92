//! Pre-aggregation orchestrator
//!
//! Keeps derived tables materialized from an analytical query engine and
//! decides, per query, which physical build of each pre-aggregation to read.
//!
//! Builds are versioned by name (see [`table_name`]): a content version that
//! follows the data through refresh-key queries, and a structure version that
//! follows the definition. [`PreAggregations`] resolves the pre-aggregations
//! of a query, serving fresh builds directly, blocking on missing or
//! structurally outdated ones, and refreshing stale content in the
//! background. Rebuilds run one at a time through a [`RebuildQueue`] and end
//! with orphan collection.

pub mod cache;
pub mod config;
pub mod descriptor;
pub mod driver;
pub mod error;
pub mod load_cache;
pub mod loader;
pub mod memory;
pub mod orchestrator;
pub mod orphans;
pub mod query_cache;
pub mod queue;
pub mod refresh;
pub mod registry;
pub mod table_name;
pub mod version;

pub use cache::CacheBackend;
pub use config::{OrchestratorOptions, QueueOptions};
pub use descriptor::{
    IndexSql, LoadResult, PreAggregationDescriptor, QueryBody, SqlQuery, UsedPreAggregation,
};
pub use driver::{
    ColumnType, DownloadedTable, Driver, DriverCapabilities, DriverFactory, Row, TableData,
    shared_driver_factory,
};
pub use error::{Error, Result};
pub use load_cache::LoadCache;
pub use loader::{Loader, LoaderOptions};
pub use orchestrator::{PreAggregations, PreAggregationsBuilder};
pub use query_cache::{CacheQueryOptions, QueryCache};
pub use queue::{QueueJob, QueueRequest, QueueStage, RebuildQueue, Stage, StageSnapshot};
pub use refresh::RefreshStrategy;
pub use registry::RefreshErrorRecord;
pub use table_name::VersionEntry;
