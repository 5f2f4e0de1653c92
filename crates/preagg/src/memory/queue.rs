use crate::config::QueueOptions;
use crate::error::{Error, Result};
use crate::queue::{QueueJob, QueueRequest, QueueStage, RebuildQueue, Stage, StageSnapshot};
use async_trait::async_trait;
use diagnostics::*;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};

type SharedOutcome = Shared<BoxFuture<'static, Result<()>>>;

struct InFlight {
    stage_key: String,
    stage: QueueStage,
    outcome: SharedOutcome,
}

/// In-process rebuild queue
///
/// Jobs with the same query key run once; later callers wait on the running
/// job. At most `concurrency` jobs execute at a time, in arrival order.
/// Jobs are spawned, so they finish even when every waiter has given up.
pub struct LocalQueue {
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<String, InFlight>>>,
    continue_wait_timeout: Option<Duration>,
}

impl LocalQueue {
    #[must_use]
    pub fn new(options: &QueueOptions) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(options.concurrency.max(1))),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            continue_wait_timeout: options.continue_wait_timeout(),
        }
    }

    /// Number of queued or running jobs
    pub async fn in_flight_count(&self) -> usize {
        self.in_flight.lock().await.len()
    }

    fn spawn(&self, key: String, job: QueueJob) -> SharedOutcome {
        let permits = self.permits.clone();
        let registry = self.in_flight.clone();

        let handle = tokio::spawn(async move {
            let outcome = match permits.acquire_owned().await {
                Ok(_permit) => {
                    if let Some(entry) = registry.lock().await.get_mut(&key) {
                        entry.stage.stage = Stage::Active;
                    }
                    job.await
                }
                Err(e) => Err(Error::Queue(e.to_string())),
            };
            _ = registry.lock().await.remove(&key);
            outcome
        });

        async move { handle.await.unwrap_or_else(|e| Err(Error::from(e))) }
            .boxed()
            .shared()
    }
}

#[async_trait]
impl RebuildQueue for LocalQueue {
    async fn execute_in_queue(&self, request: QueueRequest, job: QueueJob) -> Result<()> {
        let key = serde_json::to_string(&request.query_key)?;
        let outcome = {
            let mut in_flight = self.in_flight.lock().await;
            match in_flight.get(&key) {
                Some(existing) => {
                    debug!("Joining in-flight rebuild for {stage_key}", stage_key: existing.stage_key.as_str());
                    existing.outcome.clone()
                }
                None => {
                    let outcome = self.spawn(key.clone(), job);
                    let priority = request.priority;
                    debug!(
                        "Queued rebuild for {stage_key} at priority {priority}",
                        stage_key: request.stage_key.as_str(),
                        priority: priority
                    );
                    _ = in_flight.insert(
                        key,
                        InFlight {
                            stage_key: request.stage_key,
                            stage: QueueStage {
                                stage: Stage::Queued,
                                priority,
                            },
                            outcome: outcome.clone(),
                        },
                    );
                    outcome
                }
            }
        };

        match self.continue_wait_timeout {
            Some(timeout) => tokio::time::timeout(timeout, outcome)
                .await
                .unwrap_or(Err(Error::ContinueWait)),
            None => outcome.await,
        }
    }

    async fn fetch_stage_snapshot(&self) -> Result<StageSnapshot> {
        let in_flight = self.in_flight.lock().await;
        let stages = in_flight
            .values()
            .map(|entry| (entry.stage_key.clone(), entry.stage.clone()))
            .collect();
        Ok(StageSnapshot { stages })
    }
}
