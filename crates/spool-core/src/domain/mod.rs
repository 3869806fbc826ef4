//! Domain model (ids, jobs, execution rows, processes, queue selection).

pub mod execution;
pub mod ids;
pub mod job;
pub mod process;
pub mod queue;

pub use execution::{
    BlockedExecution, ClaimedExecution, ClaimedJob, Completion, FailedExecution, JobError,
    ReadyExecution, ScheduledExecution,
};
pub use ids::{JobId, ProcessId};
pub use job::{DEFAULT_QUEUE_NAME, Job, JobState, NewJob};
pub use process::{NewProcess, ProcessKind, ProcessRecord, PrunedProcess};
pub use queue::{QueueCounts, QueueEntry, QueueSelector};
