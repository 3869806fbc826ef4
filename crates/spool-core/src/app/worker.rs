//! Worker: claims ready executions into a bounded pool.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Notify;
use tracing::debug;

use super::pool::ExecutionPool;
use super::process::{Poll, PollOutcome};
use crate::config::WorkerConfig;
use crate::domain::{ProcessId, ProcessKind};
use crate::error::StoreError;
use crate::ports::{JobExecutor, JobStore};

pub struct Worker {
    config: WorkerConfig,
    store: Arc<dyn JobStore>,
    pool: ExecutionPool,
}

impl Worker {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        let pool = ExecutionPool::new(config.threads, Arc::clone(&store), executor);
        Self {
            config,
            store,
            pool,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// True once none of this worker's queues has ready work and no slot is busy.
    pub async fn all_work_completed(&self) -> Result<bool, StoreError> {
        Ok(self.pool.available_slots() == self.pool.size()
            && self.store.ready_count(&self.config.queues).await? == 0)
    }
}

#[async_trait]
impl Poll for Worker {
    fn kind(&self) -> ProcessKind {
        ProcessKind::Worker
    }

    fn metadata(&self) -> serde_json::Value {
        json!({
            "queues": self.config.queues.to_string(),
            "thread_pool_size": self.config.threads,
            "polling_interval": self.config.polling_interval.as_secs_f64(),
        })
    }

    fn polling_interval(&self) -> Duration {
        self.config.polling_interval
    }

    async fn poll(&self, process_id: ProcessId) -> Result<PollOutcome, StoreError> {
        let idle = self.pool.available_slots();
        if idle == 0 {
            return Ok(PollOutcome::Idle);
        }

        let claimed = self.store.claim(&self.config.queues, idle, process_id).await?;
        let count = claimed.len();
        if count > 0 {
            debug!(event = "claim", process_id = %process_id, claimed = count, idle, "posting claimed jobs");
        }
        for job in claimed {
            self.pool.post(job).await;
        }

        Ok(if count == idle {
            PollOutcome::Busy
        } else {
            PollOutcome::Idle
        })
    }

    fn wake_signal(&self) -> Option<Arc<Notify>> {
        Some(self.pool.idle_signal())
    }

    async fn drain(&self) {
        self.pool.drain().await;
    }
}
