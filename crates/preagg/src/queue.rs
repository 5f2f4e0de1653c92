//! Rebuild queue interface
//!
//! The queue serializes rebuilds. Requests with the same query key share a
//! single execution; the stage key lets callers see that a table is already
//! being rebuilt without enqueuing anything.

use crate::error::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;

/// Work executed by the queue once the request reaches the front
pub type QueueJob = BoxFuture<'static, Result<()>>;

#[derive(Debug, Clone, Serialize)]
pub struct QueueRequest {
    pub job_type: String,
    /// Deduplication key: requests with equal keys share one execution
    pub query_key: Value,
    pub stage_key: String,
    pub priority: i64,
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Queued,
    Active,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueueStage {
    pub stage: Stage,
    pub priority: i64,
}

/// Point-in-time view of in-flight work, keyed by stage key
#[derive(Debug, Clone, Default)]
pub struct StageSnapshot {
    pub stages: HashMap<String, QueueStage>,
}

#[async_trait]
pub trait RebuildQueue: Send + Sync {
    /// Run `job` in the queue and wait for it.
    ///
    /// Returns [`crate::Error::ContinueWait`] when the caller should stop
    /// waiting and re-attempt resolution later; the job keeps running.
    async fn execute_in_queue(&self, request: QueueRequest, job: QueueJob) -> Result<()>;

    async fn fetch_stage_snapshot(&self) -> Result<StageSnapshot>;

    fn lookup_stage(&self, stage_key: &str, snapshot: &StageSnapshot) -> Option<QueueStage> {
        snapshot.stages.get(stage_key).cloned()
    }
}
