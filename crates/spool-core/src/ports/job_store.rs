//! JobStore port - ジョブと実行行の正本（source of truth）
//!
//! JobStore は以下を管理します：
//! - jobs と 5 種類の execution 行（scheduled / ready / claimed / blocked / failed）
//! - claim（skip-locked で分割）
//! - concurrency key ごとの block / unblock
//! - process 登録・heartbeat・死活判定と claim 回収
//!
//! # 実装
//! - `store::memory::InMemoryJobStore`（開発・テスト用）
//! - `store::postgres::PgJobStore`（PostgreSQL）

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{
    ClaimedJob, Completion, FailedExecution, Job, JobError, JobId, JobState, NewJob, NewProcess,
    ProcessId, ProcessRecord, PrunedProcess, QueueCounts, QueueSelector,
};
use crate::error::StoreError;

/// JobStore は状態遷移の正本
///
/// # 設計原則
/// - every state transition is one atomic unit; no caller ever observes a
///   job with zero or two execution rows
/// - nothing is cached across calls; the store is shared by every process
/// - unblocking for a concurrency key is serialized per key
#[async_trait]
pub trait JobStore: Send + Sync {
    // ────────────────────────────────────────────────────────────
    // submission / lookup
    // ────────────────────────────────────────────────────────────

    /// Persists a job and its first execution row (scheduled, ready or
    /// blocked), returning the identifier synchronously.
    async fn submit(&self, job: NewJob) -> Result<JobId, StoreError>;

    async fn job(&self, job_id: JobId) -> Result<Job, StoreError>;

    async fn job_state(&self, job_id: JobId) -> Result<JobState, StoreError>;

    async fn failed_execution(&self, job_id: JobId) -> Result<Option<FailedExecution>, StoreError>;

    // ────────────────────────────────────────────────────────────
    // claim protocol
    // ────────────────────────────────────────────────────────────

    /// Claims up to `limit` ready executions for `process_id`.
    ///
    /// Rows locked by a concurrent claimant are skipped, never waited for.
    /// Ready rows whose key is at its running limit are diverted to blocked.
    /// Returns however many were claimed, possibly none.
    async fn claim(
        &self,
        queues: &QueueSelector,
        limit: usize,
        process_id: ProcessId,
    ) -> Result<Vec<ClaimedJob>, StoreError>;

    /// Marks a claimed job finished and releases the next blocked job of its key.
    async fn finish(&self, job_id: JobId, process_id: ProcessId) -> Result<Completion, StoreError>;

    /// Records a failed execution and releases the next blocked job of its key.
    async fn fail(
        &self,
        job_id: JobId,
        process_id: ProcessId,
        error: JobError,
    ) -> Result<Completion, StoreError>;

    // ────────────────────────────────────────────────────────────
    // lifecycle operations (dashboard / API)
    // ────────────────────────────────────────────────────────────

    /// Finishes a non-terminal job without success, removing its execution row.
    async fn discard(&self, job_id: JobId) -> Result<(), StoreError>;

    /// Replaces a failed execution with a fresh scheduled/ready/blocked one.
    async fn retry(&self, job_id: JobId) -> Result<JobState, StoreError>;

    // ────────────────────────────────────────────────────────────
    // dispatcher
    // ────────────────────────────────────────────────────────────

    /// Promotes up to `batch_size` due scheduled executions through the gate.
    async fn dispatch_scheduled(&self, batch_size: usize) -> Result<usize, StoreError>;

    /// Promotes the oldest blocked job of `concurrency_key` if the key has
    /// capacity. Returns the promoted job, if any.
    async fn release_blocked(&self, concurrency_key: &str) -> Result<Option<JobId>, StoreError>;

    /// Unconditionally promotes up to `limit` blocked jobs past their expiry.
    async fn release_expired_blocked(&self, limit: usize) -> Result<usize, StoreError>;

    // ────────────────────────────────────────────────────────────
    // process registry
    // ────────────────────────────────────────────────────────────

    async fn register_process(&self, process: NewProcess) -> Result<ProcessRecord, StoreError>;

    /// Fails with `ProcessNotFound` once the row was pruned by someone else.
    async fn heartbeat(&self, process_id: ProcessId) -> Result<(), StoreError>;

    /// Deletes the process row, releasing its claims. Returns how many were released.
    async fn deregister_process(&self, process_id: ProcessId) -> Result<usize, StoreError>;

    /// Deletes every process (other than `excluding`) whose last heartbeat is
    /// older than `alive_threshold`, moving its claims back to ready.
    async fn prune_dead_processes(
        &self,
        alive_threshold: Duration,
        excluding: Option<ProcessId>,
    ) -> Result<Vec<PrunedProcess>, StoreError>;

    async fn processes(&self) -> Result<Vec<ProcessRecord>, StoreError>;

    // ────────────────────────────────────────────────────────────
    // introspection
    // ────────────────────────────────────────────────────────────

    /// Distinct queue names with at least one unfinished job, sorted.
    async fn queue_names(&self) -> Result<Vec<String>, StoreError>;

    async fn queue_counts(&self) -> Result<Vec<QueueCounts>, StoreError>;

    /// Discards every unfinished job on `queue_name`. Returns how many.
    async fn clear_queue(&self, queue_name: &str) -> Result<usize, StoreError>;

    async fn ready_count(&self, queues: &QueueSelector) -> Result<usize, StoreError>;
}
