//! Bounded execution pool.
//!
//! A fixed number of slots run job bodies concurrently. A slot always reports
//! the outcome (finish or fail) and then signals `idle` so the poll loop can
//! claim again without waiting for its next tick.
//!
//! A failed outcome write is retried with backoff: the claim would otherwise
//! stay owned by this (live) process and hold its concurrency key. Once a drain
//! is requested the slot gives up and leaves the claim to pruning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, Semaphore, watch};
use tracing::{debug, error, warn};

use crate::domain::{ClaimedJob, Completion, JobError, JobId, ProcessId};
use crate::ports::{JobExecutor, JobStore};

/// Delay between attempts to record a job outcome.
///
/// delay = base_delay * multiplier^(attempts - 1), capped at `max_delay`.
#[derive(Debug, Clone, Copy)]
pub struct RecordBackoff {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RecordBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            multiplier: 2.0,
            max_delay: Duration::from_secs(10),
        }
    }
}

impl RecordBackoff {
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let exponent = i32::try_from(attempts.saturating_sub(1)).unwrap_or(i32::MAX);
        let secs = self.base_delay.as_secs_f64() * self.multiplier.powi(exponent);
        Duration::try_from_secs_f64(secs)
            .map_or(self.max_delay, |delay| delay.min(self.max_delay))
    }
}

pub struct ExecutionPool {
    size: usize,
    slots: Arc<Semaphore>,
    idle: Arc<Notify>,
    draining: watch::Sender<bool>,
    backoff: RecordBackoff,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
}

impl ExecutionPool {
    pub fn new(size: usize, store: Arc<dyn JobStore>, executor: Arc<dyn JobExecutor>) -> Self {
        Self {
            size,
            slots: Arc::new(Semaphore::new(size)),
            idle: Arc::new(Notify::new()),
            draining: watch::Sender::new(false),
            backoff: RecordBackoff::default(),
            store,
            executor,
        }
    }

    pub fn with_backoff(mut self, backoff: RecordBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Notified every time a slot frees up.
    pub fn idle_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.idle)
    }

    /// Runs `claimed` on a free slot, waiting for one if every slot is busy.
    pub async fn post(&self, claimed: ClaimedJob) {
        let Ok(permit) = Arc::clone(&self.slots).acquire_owned().await else {
            // semaphore is never closed
            return;
        };

        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let idle = Arc::clone(&self.idle);
        let backoff = self.backoff;
        let mut draining = self.draining.subscribe();

        tokio::spawn(async move {
            let ClaimedJob {
                job, process_id, ..
            } = claimed;
            let job_id = job.id;
            let class_name = job.class_name.clone();

            // 別タスクで実行して panic を slot 境界で捕まえる
            let body = tokio::spawn(async move { executor.perform(&job).await });
            let result = match body.await {
                Ok(result) => result,
                Err(join_error) if join_error.is_panic() => {
                    Err(JobError::from_panic(&*join_error.into_panic()))
                }
                Err(join_error) => Err(JobError::new("Cancelled", join_error.to_string())),
            };

            match &result {
                Ok(()) => {
                    debug!(event = "finish", job_id = %job_id, class = %class_name, "job finished")
                }
                Err(err) => {
                    warn!(event = "fail", job_id = %job_id, class = %class_name, error = %err, "job failed")
                }
            }
            record(store.as_ref(), job_id, process_id, result, backoff, &mut draining).await;

            drop(permit);
            idle.notify_one();
        });
    }

    /// Stops outcome retries, then waits until every slot is free.
    pub async fn drain(&self) {
        self.draining.send_replace(true);
        let Ok(size) = u32::try_from(self.size) else {
            return;
        };
        if let Ok(all) = self.slots.acquire_many(size).await {
            drop(all);
        }
    }
}

/// Writes the outcome until the store accepts it (or reports the claim stale).
async fn record(
    store: &dyn JobStore,
    job_id: JobId,
    process_id: ProcessId,
    result: Result<(), JobError>,
    backoff: RecordBackoff,
    draining: &mut watch::Receiver<bool>,
) {
    let mut attempts = 0u32;
    loop {
        let completion = match &result {
            Ok(()) => store.finish(job_id, process_id).await,
            Err(err) => store.fail(job_id, process_id, err.clone()).await,
        };
        let e = match completion {
            Ok(Completion::Recorded) => return,
            Ok(Completion::Stale) => {
                warn!(job_id = %job_id, "claim no longer ours; outcome dropped");
                return;
            }
            Err(e) => e,
        };

        attempts = attempts.saturating_add(1);
        if *draining.borrow() {
            error!(job_id = %job_id, error = %e, attempts, "failed to record job outcome; leaving the claim for pruning");
            return;
        }
        let delay = backoff.next_delay(attempts);
        warn!(job_id = %job_id, error = %e, attempts, retry_in_ms = delay.as_millis() as u64, "failed to record job outcome; retrying");

        tokio::select! {
            changed = draining.changed() => {
                if changed.is_err() {
                    // pool dropped
                    return;
                }
            }
            _ = tokio::time::sleep(delay) => {}
        }
    }
}
