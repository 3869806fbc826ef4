use thiserror::Error;

use crate::domain::{JobId, JobState, ProcessId};

/// Errors raised by a `JobStore`.
///
/// Claim races are not errors: a raced row is skipped and the claim returns
/// fewer rows.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("process not found: {0}")]
    ProcessNotFound(ProcessId),

    #[error("cannot {action} job {job_id} in state {from}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        action: &'static str,
    },

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

#[derive(Debug, Error)]
pub enum SpoolError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lifecycle(#[from] crate::app::lifecycle::LifecycleError),

    #[error(transparent)]
    Registry(#[from] crate::handler::RegistryError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("handler not found for class={0}")]
    HandlerNotFound(String),
}
