//! Job record and the job state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobId;

pub const DEFAULT_QUEUE_NAME: &str = "default";

/// Job state, derived from which execution row currently represents the job.
///
/// Exactly one of these holds at any time:
/// - Scheduled: a scheduled execution exists (not yet due)
/// - Ready: a ready execution exists (eligible for claim)
/// - Claimed: a claimed execution exists (owned by one process)
/// - Blocked: a blocked execution exists (concurrency key at its limit)
/// - Failed: a failed execution exists (waiting for retry or discard)
/// - Finished: `finished_at` is set (terminal, immutable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Scheduled,
    Ready,
    Claimed,
    Blocked,
    Failed,
    Finished,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Finished)
    }

    /// Is this transition legal?
    ///
    /// - Scheduled -> Ready | Blocked   (dispatcher promotion through the gate)
    /// - Ready     -> Claimed           (claim)
    /// - Ready     -> Blocked           (claim-time gate diversion)
    /// - Claimed   -> Finished | Failed (job body outcome)
    /// - Claimed   -> Ready             (reclaimed from a dead process)
    /// - Blocked   -> Ready             (unblock)
    /// - Failed    -> Scheduled | Ready | Blocked (retry)
    /// - any non-terminal -> Finished   (discard)
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;

        if self.is_terminal() {
            return false;
        }
        if next == Finished {
            return true;
        }

        matches!(
            (self, next),
            (Scheduled, Ready)
                | (Scheduled, Blocked)
                | (Ready, Claimed)
                | (Ready, Blocked)
                | (Claimed, Failed)
                | (Claimed, Ready)
                | (Blocked, Ready)
                | (Failed, Scheduled)
                | (Failed, Ready)
                | (Failed, Blocked)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Scheduled => "scheduled",
            JobState::Ready => "ready",
            JobState::Claimed => "claimed",
            JobState::Blocked => "blocked",
            JobState::Failed => "failed",
            JobState::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "scheduled" => Some(JobState::Scheduled),
            "ready" => Some(JobState::Ready),
            "claimed" => Some(JobState::Claimed),
            "blocked" => Some(JobState::Blocked),
            "failed" => Some(JobState::Failed),
            "finished" => Some(JobState::Finished),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The logical unit of work as persisted in the jobs table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub queue_name: String,
    /// Class reference used to look up the handler.
    pub class_name: String,
    /// Serialized arguments, opaque to the engine.
    pub arguments: serde_json::Value,
    /// Lower runs first.
    pub priority: i32,
    /// `None` means ready immediately.
    pub scheduled_at: Option<DateTime<Utc>>,
    pub concurrency_key: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn from_new(id: JobId, new_job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            queue_name: new_job.queue_name,
            class_name: new_job.class_name,
            arguments: new_job.arguments,
            priority: new_job.priority,
            scheduled_at: new_job.scheduled_at,
            concurrency_key: new_job.concurrency_key,
            finished_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Due now (or unscheduled)?
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.scheduled_at.is_none_or(|at| at <= now)
    }

    pub fn mark_finished(&mut self, now: DateTime<Utc>) {
        self.finished_at = Some(now);
        self.updated_at = now;
    }
}

/// Submission request accepted by `JobStore::submit`.
///
/// ```ignore
/// let job = NewJob::new("billing.charge", json!({"invoice": 42}))
///     .on_queue("billing")
///     .with_priority(-10)
///     .with_concurrency_key("customer/7");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    pub queue_name: String,
    pub class_name: String,
    pub arguments: serde_json::Value,
    pub priority: i32,
    pub scheduled_at: Option<DateTime<Utc>>,
    pub concurrency_key: Option<String>,
}

impl NewJob {
    pub fn new(class_name: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            queue_name: DEFAULT_QUEUE_NAME.to_string(),
            class_name: class_name.into(),
            arguments,
            priority: 0,
            scheduled_at: None,
            concurrency_key: None,
        }
    }

    pub fn on_queue(mut self, queue_name: impl Into<String>) -> Self {
        self.queue_name = queue_name.into();
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    pub fn with_concurrency_key(mut self, key: impl Into<String>) -> Self {
        self.concurrency_key = Some(key.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use ulid::Ulid;

    #[rstest]
    #[case::promote(JobState::Scheduled, JobState::Ready)]
    #[case::promote_blocked(JobState::Scheduled, JobState::Blocked)]
    #[case::claim(JobState::Ready, JobState::Claimed)]
    #[case::divert(JobState::Ready, JobState::Blocked)]
    #[case::fail(JobState::Claimed, JobState::Failed)]
    #[case::reclaim(JobState::Claimed, JobState::Ready)]
    #[case::unblock(JobState::Blocked, JobState::Ready)]
    #[case::retry(JobState::Failed, JobState::Ready)]
    #[case::retry_later(JobState::Failed, JobState::Scheduled)]
    #[case::discard_scheduled(JobState::Scheduled, JobState::Finished)]
    #[case::discard_failed(JobState::Failed, JobState::Finished)]
    #[case::finish(JobState::Claimed, JobState::Finished)]
    fn legal_transitions(#[case] from: JobState, #[case] to: JobState) {
        assert!(from.can_transition_to(to));
    }

    #[rstest]
    #[case::skip_claim(JobState::Scheduled, JobState::Claimed)]
    #[case::blocked_claim(JobState::Blocked, JobState::Claimed)]
    #[case::ready_fail(JobState::Ready, JobState::Failed)]
    #[case::failed_claim(JobState::Failed, JobState::Claimed)]
    #[case::reopen(JobState::Finished, JobState::Ready)]
    #[case::refinish(JobState::Finished, JobState::Finished)]
    fn illegal_transitions(#[case] from: JobState, #[case] to: JobState) {
        assert!(!from.can_transition_to(to));
    }

    #[test]
    fn new_job_defaults_to_default_queue_and_priority_zero() {
        let job = NewJob::new("hello", serde_json::json!({}));
        assert_eq!(job.queue_name, DEFAULT_QUEUE_NAME);
        assert_eq!(job.priority, 0);
        assert!(job.scheduled_at.is_none());
        assert!(job.concurrency_key.is_none());
    }

    #[test]
    fn job_is_due_when_unscheduled_or_past() {
        let now = Utc::now();
        let id = JobId::from_ulid(Ulid::new());

        let job = Job::from_new(id, NewJob::new("a", serde_json::json!(null)), now);
        assert!(job.is_due(now));

        let later = now + chrono::Duration::minutes(10);
        let job = Job::from_new(id, NewJob::new("a", serde_json::json!(null)).scheduled_at(later), now);
        assert!(!job.is_due(now));
        assert!(job.is_due(later));
    }
}
