//! Pre-aggregation descriptors and load results
//!
//! Descriptors are supplied by the caller for every query and never mutated
//! here; SQL text is an opaque payload produced by schema compilation.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// SQL text plus positional parameters.
///
/// Serializes as the two-element array `[sql, params]`; version tags are
/// computed over that form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SqlQuery(pub String, #[serde(default)] pub Vec<Value>);

impl SqlQuery {
    pub fn new<S: Into<String>>(sql: S) -> Self {
        Self(sql.into(), Vec::new())
    }

    pub fn with_params<S: Into<String>>(sql: S, params: Vec<Value>) -> Self {
        Self(sql.into(), params)
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn params(&self) -> &[Value] {
        &self.1
    }
}

/// Secondary index created on every build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexSql {
    /// Logical index name; versioned like the table itself
    pub index_name: String,
    pub sql: SqlQuery,
}

/// One logical pre-aggregation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreAggregationDescriptor {
    /// Schema-qualified logical name, also the queue stage key
    pub table_name: String,
    pub pre_aggregations_schema: String,
    /// Statement that materializes the table; may reference `table_name`
    pub load_sql: SqlQuery,
    /// Plain SELECT, streamed by read-only sources into external storage
    #[serde(default)]
    pub sql: Option<SqlQuery>,
    #[serde(default)]
    pub indexes_sql: Vec<IndexSql>,
    /// Evaluated in declared order; the order feeds the content version
    #[serde(default)]
    pub invalidate_key_queries: Vec<SqlQuery>,
    /// Per-key renewal thresholds in seconds, positionally matched
    #[serde(default)]
    pub refresh_key_renewal_thresholds: Vec<Option<u64>>,
    #[serde(default)]
    pub external: bool,
    #[serde(default)]
    pub priority: Option<i64>,
}

impl PreAggregationDescriptor {
    pub fn new<T, S>(table_name: T, schema: S, load_sql: SqlQuery) -> Self
    where
        T: Into<String>,
        S: Into<String>,
    {
        Self {
            table_name: table_name.into(),
            pre_aggregations_schema: schema.into(),
            load_sql,
            sql: None,
            indexes_sql: Vec::new(),
            invalidate_key_queries: Vec::new(),
            refresh_key_renewal_thresholds: Vec::new(),
            external: false,
            priority: None,
        }
    }

    #[must_use]
    pub fn with_key_query(mut self, key_query: SqlQuery) -> Self {
        self.invalidate_key_queries.push(key_query);
        self
    }

    #[must_use]
    pub fn with_index(mut self, index: IndexSql) -> Self {
        self.indexes_sql.push(index);
        self
    }

    #[must_use]
    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    #[must_use]
    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    #[must_use]
    pub fn with_sql(mut self, sql: SqlQuery) -> Self {
        self.sql = Some(sql);
        self
    }

    /// Explicit priority, or the given default
    #[must_use]
    pub fn priority_or(&self, default: i64) -> i64 {
        self.priority.unwrap_or(default)
    }

    /// Query streamed by the external strategy
    #[must_use]
    pub fn select_sql(&self) -> &SqlQuery {
        self.sql.as_ref().unwrap_or(&self.load_sql)
    }

    /// Key used to detect in-flight queue work for this table
    #[must_use]
    pub fn stage_key(&self) -> &str {
        &self.table_name
    }

    #[must_use]
    pub fn renewal_threshold(&self, index: usize) -> Option<u64> {
        self.refresh_key_renewal_thresholds.get(index).copied().flatten()
    }
}

/// Outcome of loading one pre-aggregation
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LoadResult {
    /// Served through the non-blocking fast path
    Resolved { table_name: String },
    /// Fully resolved against freshly evaluated refresh keys
    ResolvedWithKeys {
        table_name: String,
        refresh_key_values: Vec<Value>,
    },
}

impl LoadResult {
    #[must_use]
    pub fn target_table_name(&self) -> &str {
        match self {
            LoadResult::Resolved { table_name } => table_name,
            LoadResult::ResolvedWithKeys { table_name, .. } => table_name,
        }
    }
}

/// A logical table and the physical build chosen for it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UsedPreAggregation {
    pub table_name: String,
    pub result: LoadResult,
}

/// The pre-aggregations referenced by one query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueryBody {
    #[serde(default)]
    pub pre_aggregations: Vec<PreAggregationDescriptor>,
    /// Block until every stale table has been rebuilt
    #[serde(default)]
    pub renew_query: bool,
    #[serde(default)]
    pub request_id: Option<String>,
}
