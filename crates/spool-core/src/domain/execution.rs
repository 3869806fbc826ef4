//! Execution rows: one per non-finished job, each naming the job's state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, ProcessId};
use super::job::Job;

/// A job that is not yet due.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledExecution {
    pub job_id: JobId,
    pub queue_name: String,
    pub priority: i32,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A job eligible for immediate claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyExecution {
    pub job_id: JobId,
    pub queue_name: String,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
}

impl ReadyExecution {
    pub fn for_job(job: &Job, now: DateTime<Utc>) -> Self {
        Self {
            job_id: job.id,
            queue_name: job.queue_name.clone(),
            priority: job.priority,
            created_at: now,
        }
    }

    /// Claim order: priority, then job age.
    pub fn claim_order(&self) -> (i32, JobId) {
        (self.priority, self.job_id)
    }
}

/// A job owned by exactly one live process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimedExecution {
    pub job_id: JobId,
    pub process_id: ProcessId,
    pub created_at: DateTime<Utc>,
}

/// A job withheld because its concurrency key is at its limit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedExecution {
    pub job_id: JobId,
    pub queue_name: String,
    pub priority: i32,
    pub concurrency_key: String,
    /// Past this instant the maintenance sweep releases the job unconditionally.
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl BlockedExecution {
    pub fn release_order(&self) -> (i32, JobId) {
        (self.priority, self.job_id)
    }
}

/// A job whose body raised; waits for retry or discard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedExecution {
    pub job_id: JobId,
    pub error: JobError,
    pub created_at: DateTime<Utc>,
}

/// A claimed execution together with the job it represents, as handed to a
/// worker slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimedJob {
    pub job: Job,
    pub process_id: ProcessId,
    pub claimed_at: DateTime<Utc>,
}

/// Structured failure of a job body, stored as JSON on the failed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{class}: {message}")]
pub struct JobError {
    /// Error class (type name, or "panic").
    pub class: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub backtrace: Vec<String>,
}

impl JobError {
    pub fn new(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            message: message.into(),
            backtrace: Vec::new(),
        }
    }

    /// Converts a panic payload caught at the slot boundary.
    pub fn from_panic(payload: &(dyn std::any::Any + Send)) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "job body panicked".to_string()
        };
        Self::new("panic", message)
    }
}

/// Result of reporting a job outcome for a claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The claim was ours and the outcome was recorded.
    Recorded,
    /// The claim no longer belongs to the caller (discarded or reclaimed
    /// meanwhile); nothing changed.
    Stale,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_error_round_trips_through_json_without_empty_backtrace() {
        let error = JobError::new("Timeout", "upstream took too long");
        let json = serde_json::to_value(&error).unwrap();
        assert_eq!(json, serde_json::json!({"class": "Timeout", "message": "upstream took too long"}));

        let back: JobError = serde_json::from_value(json).unwrap();
        assert_eq!(back, error);
        assert_eq!(back.to_string(), "Timeout: upstream took too long");
    }

    #[test]
    fn panic_payloads_become_panic_errors() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        let error = JobError::from_panic(payload.as_ref());
        assert_eq!(error.class, "panic");
        assert_eq!(error.message, "boom");

        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(JobError::from_panic(payload.as_ref()).message, "kaboom");
    }
}
