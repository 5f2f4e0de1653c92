//! Shared fixtures for orchestrator integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use futures::StreamExt;
use preagg::memory::LocalQueue;
use preagg::{
    CacheQueryOptions, ColumnType, DownloadedTable, Driver, DriverCapabilities, Error,
    LoaderOptions, OrchestratorOptions, PreAggregationDescriptor, PreAggregations, QueryBody,
    QueryCache, QueueJob,
    QueueOptions, QueueRequest, QueueStage, RebuildQueue, Result, Row, SqlQuery, StageSnapshot,
    TableData, shared_driver_factory,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

pub const SCHEMA: &str = "stb_pre_aggregations";
pub const TABLE: &str = "stb_pre_aggregations.orders_rollup";
pub const KEY_SQL: &str = "SELECT max(id) FROM orders";

/// Driver keeping tables in memory and recording every call
pub struct MockDriver {
    capabilities: DriverCapabilities,
    tables: Mutex<BTreeMap<String, BTreeSet<String>>>,
    calls: Mutex<Vec<String>>,
    uploaded_rows: Mutex<HashMap<String, usize>>,
    fail_loads: AtomicBool,
    load_delay: Mutex<Option<Duration>>,
    list_delay: Mutex<Option<Duration>>,
    name_limit: Mutex<Option<usize>>,
}

impl MockDriver {
    pub fn new(capabilities: DriverCapabilities) -> Arc<Self> {
        Arc::new(Self {
            capabilities,
            tables: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            uploaded_rows: Mutex::new(HashMap::new()),
            fail_loads: AtomicBool::new(false),
            load_delay: Mutex::new(None),
            list_delay: Mutex::new(None),
            name_limit: Mutex::new(None),
        })
    }

    pub fn writable() -> Arc<Self> {
        Self::new(DriverCapabilities {
            read_only: false,
            download_table: true,
            download_query_results: true,
            upload_table: true,
        })
    }

    pub fn add_table(&self, schema: &str, raw: &str) {
        _ = self
            .tables
            .lock()
            .unwrap()
            .entry(schema.to_string())
            .or_default()
            .insert(raw.to_string());
    }

    pub fn has_table(&self, qualified: &str) -> bool {
        let (schema, raw) = qualified.split_once('.').unwrap();
        self.tables
            .lock()
            .unwrap()
            .get(schema)
            .is_some_and(|t| t.contains(raw))
    }

    pub fn table_count(&self, schema: &str) -> usize {
        self.tables.lock().unwrap().get(schema).map_or(0, |t| t.len())
    }

    pub fn set_fail_loads(&self, fail: bool) {
        self.fail_loads.store(fail, Ordering::SeqCst);
    }

    pub fn set_load_delay(&self, delay: Duration) {
        *self.load_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_list_delay(&self, delay: Duration) {
        *self.list_delay.lock().unwrap() = Some(delay);
    }

    /// Stores created tables under at most `limit` characters of their name
    pub fn set_name_limit(&self, limit: usize) {
        *self.name_limit.lock().unwrap() = Some(limit);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_starting_with(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    pub fn uploaded_rows(&self, table: &str) -> Option<usize> {
        self.uploaded_rows.lock().unwrap().get(table).copied()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    fn create(&self, qualified: &str) -> Result<()> {
        let (schema, raw) = qualified
            .split_once('.')
            .ok_or_else(|| Error::driver_message(format!("unqualified table {qualified}")))?;
        let limit = *self.name_limit.lock().unwrap();
        let raw: String = raw.chars().take(limit.unwrap_or(usize::MAX)).collect();
        self.add_table(schema, &raw);
        Ok(())
    }

    fn sample_rows() -> Vec<Row> {
        (1..=3)
            .map(|i| {
                let mut row = Row::new();
                _ = row.insert("id".to_string(), json!(i));
                row
            })
            .collect()
    }
}

#[async_trait]
impl Driver for MockDriver {
    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>> {
        self.record(format!("list_tables {schema}"));
        let delay = *self.list_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(self
            .tables
            .lock()
            .unwrap()
            .get(schema)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn create_schema_if_not_exists(&self, schema: &str) -> Result<()> {
        self.record(format!("create_schema {schema}"));
        Ok(())
    }

    async fn load_pre_aggregation_into_table(
        &self,
        table: &str,
        sql: &str,
        _params: &[Value],
    ) -> Result<()> {
        self.record(format!("load {table} <- {sql}"));
        let delay = *self.load_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_loads.load(Ordering::SeqCst) {
            return Err(Error::driver_message("load failed"));
        }
        self.create(table)
    }

    async fn query(&self, sql: &str, _params: &[Value]) -> Result<Vec<Row>> {
        self.record(format!("query {sql}"));
        Ok(Vec::new())
    }

    async fn drop_table(&self, table: &str) -> Result<()> {
        self.record(format!("drop {table}"));
        let (schema, raw) = table.split_once('.').unwrap_or(("", table));
        if let Some(tables) = self.tables.lock().unwrap().get_mut(schema) {
            _ = tables.remove(raw);
        }
        Ok(())
    }

    async fn table_column_types(&self, table: &str) -> Result<Vec<ColumnType>> {
        self.record(format!("column_types {table}"));
        Ok(vec![ColumnType::new("id", "int")])
    }

    async fn download_table(&self, table: &str) -> Result<TableData> {
        if !self.capabilities.download_table {
            return Err(Error::capability("source driver doesn't support downloadTable()"));
        }
        self.record(format!("download_table {table}"));
        Ok(TableData::Rows(Self::sample_rows()))
    }

    async fn download_query_results(&self, sql: &str, _params: &[Value]) -> Result<DownloadedTable> {
        if !self.capabilities.download_query_results {
            return Err(Error::capability(
                "source driver doesn't support downloadQueryResults()",
            ));
        }
        self.record(format!("download_query {sql}"));
        let rows = futures::stream::iter(Self::sample_rows().into_iter().map(Ok)).boxed();
        Ok(DownloadedTable {
            types: vec![ColumnType::new("id", "int")],
            data: TableData::Stream(rows),
        })
    }

    async fn upload_table(&self, table: &str, _types: &[ColumnType], data: TableData) -> Result<()> {
        if !self.capabilities.upload_table {
            return Err(Error::capability("destination driver doesn't support uploadTable()"));
        }
        self.record(format!("upload {table}"));
        let rows = match data {
            TableData::Rows(rows) => rows.len(),
            TableData::Stream(stream) => {
                let rows: Vec<Result<Row>> = stream.collect().await;
                rows.into_iter().collect::<Result<Vec<Row>>>()?.len()
            }
        };
        _ = self
            .uploaded_rows
            .lock()
            .unwrap()
            .insert(table.to_string(), rows);
        self.create(table)
    }
}

/// Query cache answering refresh-key queries from a fixed table
#[derive(Default)]
pub struct MockQueryCache {
    values: Mutex<HashMap<String, Value>>,
    calls: Mutex<Vec<(String, CacheQueryOptions)>>,
}

impl MockQueryCache {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_value(&self, sql: &str, value: Value) {
        _ = self.values.lock().unwrap().insert(sql.to_string(), value);
    }

    pub fn calls(&self) -> Vec<(String, CacheQueryOptions)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryCache for MockQueryCache {
    async fn cache_query_result(
        &self,
        sql: &str,
        _params: &[Value],
        _cache_key: Value,
        _expire_secs: u64,
        options: CacheQueryOptions,
    ) -> Result<Value> {
        self.calls.lock().unwrap().push((sql.to_string(), options));
        Ok(self
            .values
            .lock()
            .unwrap()
            .get(sql)
            .cloned()
            .unwrap_or_else(|| json!([{"max": 1}])))
    }
}

/// Local queue that remembers every request it was given
pub struct RecordingQueue {
    inner: LocalQueue,
    requests: Mutex<Vec<QueueRequest>>,
}

impl RecordingQueue {
    pub fn new(options: &QueueOptions) -> Arc<Self> {
        Arc::new(Self {
            inner: LocalQueue::new(options),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<QueueRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn priorities(&self) -> Vec<i64> {
        self.requests().iter().map(|r| r.priority).collect()
    }
}

#[async_trait]
impl RebuildQueue for RecordingQueue {
    async fn execute_in_queue(&self, request: QueueRequest, job: QueueJob) -> Result<()> {
        self.requests.lock().unwrap().push(request.clone());
        self.inner.execute_in_queue(request, job).await
    }

    async fn fetch_stage_snapshot(&self) -> Result<StageSnapshot> {
        self.inner.fetch_stage_snapshot().await
    }

    fn lookup_stage(&self, stage_key: &str, snapshot: &StageSnapshot) -> Option<QueueStage> {
        self.inner.lookup_stage(stage_key, snapshot)
    }
}

/// Orchestrator wired to mocks
pub struct Harness {
    pub orchestrator: PreAggregations,
    pub source: Arc<MockDriver>,
    pub external: Arc<MockDriver>,
    pub query_cache: Arc<MockQueryCache>,
    pub queue: Arc<RecordingQueue>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(MockDriver::writable(), MockDriver::writable(), OrchestratorOptions::default())
    }

    pub fn with(
        source: Arc<MockDriver>,
        external: Arc<MockDriver>,
        options: OrchestratorOptions,
    ) -> Self {
        let query_cache = MockQueryCache::new();
        let queue = RecordingQueue::new(&options.queue);
        let orchestrator = PreAggregations::builder(shared_driver_factory(source.clone()), query_cache.clone())
            .options(options)
            .external_driver_factory(shared_driver_factory(external.clone()))
            .queue(queue.clone())
            .build();
        Self {
            orchestrator,
            source,
            external,
            query_cache,
            queue,
        }
    }
}

pub fn orders_rollup() -> PreAggregationDescriptor {
    PreAggregationDescriptor::new(
        TABLE,
        SCHEMA,
        SqlQuery::new(format!(
            "CREATE TABLE {TABLE} AS SELECT status, count(*) FROM orders GROUP BY 1"
        )),
    )
    .with_key_query(SqlQuery::new(KEY_SQL))
}

/// Raw name of a build of `orders_rollup`
pub fn raw_build(content_version: &str, structure_version: &str, ts: i64) -> String {
    format!("orders_rollup_{content_version}_{structure_version}_{ts}")
}

/// Content and structure version the orchestrator computes for `keys`
pub fn versions(
    orchestrator: &PreAggregations,
    descriptor: &PreAggregationDescriptor,
    keys: &[Value],
) -> (String, String) {
    let loader = orchestrator.loader(
        descriptor.clone(),
        orchestrator.load_cache(),
        Vec::new(),
        LoaderOptions::default(),
    );
    (
        loader.content_version(keys).unwrap(),
        loader.structure_version().unwrap(),
    )
}

pub fn query_body(pre_aggregations: Vec<PreAggregationDescriptor>, renew_query: bool) -> QueryBody {
    QueryBody {
        pre_aggregations,
        renew_query,
        request_id: Some("test-request".to_string()),
    }
}
