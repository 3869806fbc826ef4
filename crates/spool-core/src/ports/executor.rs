//! JobExecutor port - ジョブ本体の実行

use async_trait::async_trait;

use crate::domain::{Job, JobError};

/// Runs the body of a claimed job.
///
/// Owned by the host application. Returning `Err` (or panicking) records a
/// failed execution; it never stops the worker.
#[async_trait]
pub trait JobExecutor: Send + Sync {
    async fn perform(&self, job: &Job) -> Result<(), JobError>;
}
