//! PostgreSQL-backed job store.
//!
//! Every state transition runs in one transaction, so no other process can
//! observe a job with zero or two execution rows.
//!
//! ## Locking
//!
//! | Concern | Mechanism |
//! |---|---|
//! | claim partitioning | `SELECT ... FOR UPDATE OF r SKIP LOCKED` on ready rows |
//! | per-key gate / unblock | `pg_advisory_xact_lock` on a hash of the concurrency key |
//! | raced rows | compare-and-delete (`DELETE ... WHERE ...`, check rows affected) |
//!
//! Transactions take the advisory locks for every key they touch first, in
//! sorted order, and only then lock rows. `claim` is the one exception: it
//! already holds ready rows, so it only *tries* the key lock and leaves the row
//! for a later poll when the key is busy. No transaction ever waits for a key
//! while holding a row someone else's key holder needs.
//!
//! ## Error Mapping
//!
//! Every `sqlx::Error` becomes `StoreError::Database` tagged with the
//! operation name; loops log it and retry on their next tick.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool, Row};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::concurrency::{
    self, ConcurrencyPolicy, Placement, StaticConcurrencyPolicy, admits,
};
use crate::domain::{
    ClaimedJob, Completion, FailedExecution, Job, JobError, JobId, JobState, NewJob, NewProcess,
    ProcessId, ProcessKind, ProcessRecord, PrunedProcess, QueueCounts, QueueEntry, QueueSelector,
};
use crate::error::StoreError;
use crate::ports::{Clock, IdGenerator, JobStore, UlidGenerator};

/// DDL for every table and index the store uses. Idempotent.
pub const SCHEMA: &str = include_str!("schema.sql");

const JOB_COLUMNS: &str = "id, queue_name, class_name, arguments, priority, scheduled_at, \
                           concurrency_key, finished_at, created_at, updated_at";

/// Candidate rows per free slot; see `candidate_window`.
const CLAIM_OVERFETCH: usize = 2;

const PROCESS_COLUMNS: &str =
    "id, kind, hostname, pid, supervisor_id, metadata, created_at, last_heartbeat_at";

/// Candidate ready row selected by a claim.
struct Candidate {
    job_id: JobId,
    queue_name: String,
    priority: i32,
    concurrency_key: Option<String>,
}

/// PostgreSQL `JobStore`.
///
/// Timestamps come from the injected `Clock`, not from `now()` in SQL, so the
/// store behaves identically to the in-memory one under a fixed clock.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    policy: Arc<dyn ConcurrencyPolicy>,
}

impl PgJobStore {
    pub fn new(
        pool: PgPool,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        policy: Arc<dyn ConcurrencyPolicy>,
    ) -> Self {
        Self {
            pool,
            clock,
            ids,
            policy,
        }
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        Self::new(pool, clock, ids, Arc::new(StaticConcurrencyPolicy::default()))
    }

    pub fn with_policy(mut self, policy: Arc<dyn ConcurrencyPolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the tables and indexes if they do not exist yet.
    #[instrument(skip(self), err)]
    pub async fn install_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("install_schema", e))?;
        Ok(())
    }

    // ────────────────────────────────────────────────────────────
    // helpers running inside a caller's transaction
    // ────────────────────────────────────────────────────────────

    async fn job_in(&self, conn: &mut PgConnection, job_id: JobId) -> Result<Job, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM spool_jobs WHERE id = $1"))
            .bind(job_id.to_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?
            .ok_or(StoreError::JobNotFound(job_id))?;
        job_from_row(&row)
    }

    async fn jobs_in(
        &self,
        conn: &mut PgConnection,
        job_ids: &[JobId],
    ) -> Result<HashMap<JobId, Job>, StoreError> {
        let uuids: Vec<Uuid> = job_ids.iter().map(JobId::to_uuid).collect();
        let rows = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM spool_jobs WHERE id = ANY($1)"))
            .bind(&uuids)
            .fetch_all(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("load_jobs", e))?;

        rows.iter()
            .map(|row| job_from_row(row).map(|job| (job.id, job)))
            .collect()
    }

    async fn key_of(
        &self,
        conn: &mut PgConnection,
        job_id: JobId,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT concurrency_key FROM spool_jobs WHERE id = $1")
            .bind(job_id.to_uuid())
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("load_concurrency_key", e))?
            .ok_or(StoreError::JobNotFound(job_id))?;
        row.try_get("concurrency_key")
            .map_err(|e| map_sqlx_error("load_concurrency_key", e))
    }

    async fn state_in(&self, conn: &mut PgConnection, job_id: JobId) -> Result<JobState, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT CASE
                WHEN j.finished_at IS NOT NULL THEN 'finished'
                WHEN EXISTS (SELECT 1 FROM spool_scheduled_executions e WHERE e.job_id = j.id) THEN 'scheduled'
                WHEN EXISTS (SELECT 1 FROM spool_ready_executions e WHERE e.job_id = j.id) THEN 'ready'
                WHEN EXISTS (SELECT 1 FROM spool_claimed_executions e WHERE e.job_id = j.id) THEN 'claimed'
                WHEN EXISTS (SELECT 1 FROM spool_blocked_executions e WHERE e.job_id = j.id) THEN 'blocked'
                WHEN EXISTS (SELECT 1 FROM spool_failed_executions e WHERE e.job_id = j.id) THEN 'failed'
            END AS state
            FROM spool_jobs j
            WHERE j.id = $1
            "#,
        )
        .bind(job_id.to_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("job_state", e))?
        .ok_or(StoreError::JobNotFound(job_id))?;

        let state: Option<String> = row
            .try_get("state")
            .map_err(|e| map_sqlx_error("job_state", e))?;
        state
            .as_deref()
            .and_then(JobState::parse)
            .ok_or_else(|| StoreError::Database(format!("job {job_id} has no execution row")))
    }

    /// Ready + claimed jobs holding `key`.
    async fn admitted(&self, conn: &mut PgConnection, key: &str) -> Result<usize, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT count(*) FROM spool_ready_executions r
                   JOIN spool_jobs j ON j.id = r.job_id
                  WHERE j.concurrency_key = $1)
              + (SELECT count(*) FROM spool_claimed_executions c
                   JOIN spool_jobs j ON j.id = c.job_id
                  WHERE j.concurrency_key = $1) AS admitted
            "#,
        )
        .bind(key)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("count_admitted", e))?;
        count_from_row(&row, "admitted")
    }

    /// Claimed jobs holding `key`.
    async fn running(&self, conn: &mut PgConnection, key: &str) -> Result<usize, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT count(*) AS running
              FROM spool_claimed_executions c
              JOIN spool_jobs j ON j.id = c.job_id
             WHERE j.concurrency_key = $1
            "#,
        )
        .bind(key)
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("count_running", e))?;
        count_from_row(&row, "running")
    }

    /// Inserts the execution row for a job that currently has none. The caller
    /// holds the job's key lock.
    async fn place(
        &self,
        conn: &mut PgConnection,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<JobState, StoreError> {
        if let Some(at) = job.scheduled_at.filter(|at| *at > now) {
            sqlx::query(
                r#"
                INSERT INTO spool_scheduled_executions (job_id, queue_name, priority, scheduled_at, created_at)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(job.id.to_uuid())
            .bind(&job.queue_name)
            .bind(job.priority)
            .bind(at)
            .bind(now)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("insert_scheduled", e))?;
            return Ok(JobState::Scheduled);
        }

        self.gate(conn, job, now).await
    }

    /// Ready or blocked, per the key's admitted count.
    async fn gate(
        &self,
        conn: &mut PgConnection,
        job: &Job,
        now: DateTime<Utc>,
    ) -> Result<JobState, StoreError> {
        if let Some(key) = job.concurrency_key.as_deref() {
            let limit = self.policy.limit_for(key);
            let admitted = self.admitted(conn, key).await?;
            if let Placement::Blocked { expires_at } = concurrency::placement(admitted, &limit, now) {
                insert_blocked(conn, job.id, &job.queue_name, job.priority, key, expires_at, now).await?;
                return Ok(JobState::Blocked);
            }
        }

        insert_ready(conn, job.id, &job.queue_name, job.priority, now).await?;
        Ok(JobState::Ready)
    }

    /// Promotes the oldest blocked job of `key` while the key has capacity.
    /// The caller holds the key lock.
    async fn release_next(
        &self,
        conn: &mut PgConnection,
        key: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<JobId>, StoreError> {
        let admitted = self.admitted(conn, key).await?;
        if !admits(admitted, &self.policy.limit_for(key)) {
            return Ok(None);
        }

        let row = sqlx::query(
            r#"
            DELETE FROM spool_blocked_executions
             WHERE job_id = (
                 SELECT job_id FROM spool_blocked_executions
                  WHERE concurrency_key = $1
                  ORDER BY priority ASC, job_id ASC
                  LIMIT 1
                  FOR UPDATE
             )
            RETURNING job_id, queue_name, priority
            "#,
        )
        .bind(key)
        .fetch_optional(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("release_blocked", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let (job_id, queue_name, priority) =
            blocked_from_row(&row).map_err(|e| map_sqlx_error("release_blocked", e))?;
        insert_ready(conn, job_id, &queue_name, priority, now).await?;

        debug!(event = "release_blocked", job_id = %job_id, concurrency_key = key, "unblocked job");
        Ok(Some(job_id))
    }

    async fn complete(
        &self,
        job_id: JobId,
        process_id: ProcessId,
        error: Option<JobError>,
    ) -> Result<Completion, StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let key = self.key_of(&mut tx, job_id).await?;
        if let Some(key) = key.as_deref() {
            lock_keys(&mut tx, [key]).await?;
        }

        let deleted = sqlx::query(
            "DELETE FROM spool_claimed_executions WHERE job_id = $1 AND process_id = $2",
        )
        .bind(job_id.to_uuid())
        .bind(process_id.to_uuid())
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("delete_claimed", e))?
        .rows_affected();

        if deleted == 0 {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Ok(Completion::Stale);
        }

        match error {
            None => {
                mark_finished(&mut tx, job_id, now).await?;
            }
            Some(error) => {
                sqlx::query(
                    "INSERT INTO spool_failed_executions (job_id, error, created_at) VALUES ($1, $2, $3)",
                )
                .bind(job_id.to_uuid())
                .bind(Json(&error))
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_failed", e))?;
            }
        }

        if let Some(key) = key.as_deref() {
            self.release_next(&mut tx, key, now).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(Completion::Recorded)
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(
        skip(self, new_job),
        fields(queue = %new_job.queue_name, class = %new_job.class_name),
        err
    )]
    async fn submit(&self, new_job: NewJob) -> Result<JobId, StoreError> {
        let now = self.clock.now();
        let job = Job::from_new(self.ids.generate_job_id(), new_job, now);

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        if let Some(key) = job.concurrency_key.as_deref() {
            lock_keys(&mut tx, [key]).await?;
        }

        sqlx::query(&format!(
            "INSERT INTO spool_jobs ({JOB_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"
        ))
        .bind(job.id.to_uuid())
        .bind(&job.queue_name)
        .bind(&job.class_name)
        .bind(&job.arguments)
        .bind(job.priority)
        .bind(job.scheduled_at)
        .bind(&job.concurrency_key)
        .bind(job.finished_at)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("insert_job", e))?;

        let state = self.place(&mut tx, &job, now).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        debug!(job_id = %job.id, state = %state, "job submitted");
        Ok(job.id)
    }

    async fn job(&self, job_id: JobId) -> Result<Job, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        self.job_in(&mut conn, job_id).await
    }

    async fn job_state(&self, job_id: JobId) -> Result<JobState, StoreError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| map_sqlx_error("acquire", e))?;
        self.state_in(&mut conn, job_id).await
    }

    async fn failed_execution(&self, job_id: JobId) -> Result<Option<FailedExecution>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT j.id, f.error, f.created_at
              FROM spool_jobs j
              LEFT JOIN spool_failed_executions f ON f.job_id = j.id
             WHERE j.id = $1
            "#,
        )
        .bind(job_id.to_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("failed_execution", e))?
        .ok_or(StoreError::JobNotFound(job_id))?;

        let error: Option<Json<JobError>> = rows
            .try_get("error")
            .map_err(|e| map_sqlx_error("failed_execution", e))?;
        let created_at: Option<DateTime<Utc>> = rows
            .try_get("created_at")
            .map_err(|e| map_sqlx_error("failed_execution", e))?;

        Ok(error.zip(created_at).map(|(Json(error), created_at)| FailedExecution {
            job_id,
            error,
            created_at,
        }))
    }

    #[instrument(skip(self, queues), fields(queues = %queues, process_id = %process_id), err)]
    async fn claim(
        &self,
        queues: &QueueSelector,
        limit: usize,
        process_id: ProcessId,
    ) -> Result<Vec<ClaimedJob>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut claimed: Vec<JobId> = Vec::with_capacity(limit);
        let mut diverted = 0usize;

        // 先頭のエントリから順に。claim した行は同じ tx 内で消えるので次のエントリで重複しない
        for entry in queues.entries() {
            let remaining = limit - claimed.len();
            if remaining == 0 {
                break;
            }

            for candidate in select_candidates(&mut tx, entry, candidate_window(remaining)).await? {
                if claimed.len() >= limit {
                    break;
                }
                if let Some(key) = candidate.concurrency_key.as_deref() {
                    if !try_lock_key(&mut tx, key).await? {
                        continue;
                    }
                    let key_limit = self.policy.limit_for(key);
                    if !admits(self.running(&mut tx, key).await?, &key_limit) {
                        delete_ready(&mut tx, candidate.job_id).await?;
                        insert_blocked(
                            &mut tx,
                            candidate.job_id,
                            &candidate.queue_name,
                            candidate.priority,
                            key,
                            concurrency::after(now, key_limit.blocked_for),
                            now,
                        )
                        .await?;
                        diverted += 1;
                        continue;
                    }
                }

                if !delete_ready(&mut tx, candidate.job_id).await? {
                    continue;
                }
                sqlx::query(
                    "INSERT INTO spool_claimed_executions (job_id, process_id, created_at) VALUES ($1, $2, $3)",
                )
                .bind(candidate.job_id.to_uuid())
                .bind(process_id.to_uuid())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("insert_claimed", e))?;
                claimed.push(candidate.job_id);
            }
        }

        let mut jobs = self.jobs_in(&mut tx, &claimed).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if !claimed.is_empty() || diverted > 0 {
            debug!(
                event = "claim",
                claimed = claimed.len(),
                diverted,
                "claimed ready executions"
            );
        }

        Ok(claimed
            .into_iter()
            .filter_map(|job_id| jobs.remove(&job_id))
            .map(|job| ClaimedJob {
                job,
                process_id,
                claimed_at: now,
            })
            .collect())
    }

    #[instrument(skip(self), fields(job_id = %job_id, process_id = %process_id), err)]
    async fn finish(&self, job_id: JobId, process_id: ProcessId) -> Result<Completion, StoreError> {
        self.complete(job_id, process_id, None).await
    }

    #[instrument(skip(self, error), fields(job_id = %job_id, process_id = %process_id, error_class = %error.class), err)]
    async fn fail(
        &self,
        job_id: JobId,
        process_id: ProcessId,
        error: JobError,
    ) -> Result<Completion, StoreError> {
        self.complete(job_id, process_id, Some(error)).await
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn discard(&self, job_id: JobId) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let key = self.key_of(&mut tx, job_id).await?;
        if let Some(key) = key.as_deref() {
            lock_keys(&mut tx, [key]).await?;
        }

        let from = self.state_in(&mut tx, job_id).await?;
        if from.is_terminal() {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::InvalidTransition {
                job_id,
                from,
                action: "discard",
            });
        }

        delete_executions(&mut tx, job_id).await?;
        mark_finished(&mut tx, job_id, now).await?;
        if let Some(key) = key.as_deref() {
            self.release_next(&mut tx, key, now).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        info!(event = "discard", job_id = %job_id, from = %from, "discarded job");
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn retry(&self, job_id: JobId) -> Result<JobState, StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let key = self.key_of(&mut tx, job_id).await?;
        if let Some(key) = key.as_deref() {
            lock_keys(&mut tx, [key]).await?;
        }

        let deleted = sqlx::query("DELETE FROM spool_failed_executions WHERE job_id = $1")
            .bind(job_id.to_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_failed", e))?
            .rows_affected();

        if deleted == 0 {
            let from = self.state_in(&mut tx, job_id).await?;
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(StoreError::InvalidTransition {
                job_id,
                from,
                action: "retry",
            });
        }

        let job = self.job_in(&mut tx, job_id).await?;
        let state = self.place(&mut tx, &job, now).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        info!(event = "retry", job_id = %job_id, state = %state, "retried job");
        Ok(state)
    }

    #[instrument(skip(self), err)]
    async fn dispatch_scheduled(&self, batch_size: usize) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        // 行ロックより先に key のロックを取る（順序を固定してデッドロックを避ける）
        let due = sqlx::query(
            r#"
            SELECT s.job_id, j.concurrency_key
              FROM spool_scheduled_executions s
              JOIN spool_jobs j ON j.id = s.job_id
             WHERE s.scheduled_at <= $1
             ORDER BY s.scheduled_at ASC, s.priority ASC, s.job_id ASC
             LIMIT $2
            "#,
        )
        .bind(now)
        .bind(batch_size as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_due_scheduled", e))?;

        let mut job_ids = Vec::with_capacity(due.len());
        let mut keys = BTreeSet::new();
        for row in &due {
            let (job_id, key) = id_and_key_from_row(row).map_err(|e| map_sqlx_error("select_due_scheduled", e))?;
            job_ids.push(job_id);
            keys.extend(key);
        }
        lock_keys(&mut tx, keys.iter().map(String::as_str)).await?;

        let mut jobs = self.jobs_in(&mut tx, &job_ids).await?;
        let mut promoted = 0;
        for job_id in job_ids {
            let deleted = sqlx::query("DELETE FROM spool_scheduled_executions WHERE job_id = $1")
                .bind(job_id.to_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("delete_scheduled", e))?
                .rows_affected();
            if deleted == 0 {
                continue;
            }
            let Some(job) = jobs.remove(&job_id) else {
                continue;
            };
            self.gate(&mut tx, &job, now).await?;
            promoted += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if promoted > 0 {
            debug!(event = "dispatch_scheduled", promoted, batch_size, "promoted scheduled jobs");
        }
        Ok(promoted)
    }

    #[instrument(skip(self), err)]
    async fn release_blocked(&self, concurrency_key: &str) -> Result<Option<JobId>, StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        lock_keys(&mut tx, [concurrency_key]).await?;
        let released = self.release_next(&mut tx, concurrency_key, now).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(released)
    }

    #[instrument(name = "release_many_blocked", skip(self), err)]
    async fn release_expired_blocked(&self, limit: usize) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let expired = sqlx::query(
            r#"
            SELECT job_id, concurrency_key
              FROM spool_blocked_executions
             WHERE expires_at <= $1
             ORDER BY priority ASC, job_id ASC
             LIMIT $2
            "#,
        )
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("select_expired_blocked", e))?;

        let mut job_ids = Vec::with_capacity(expired.len());
        let mut keys = BTreeSet::new();
        for row in &expired {
            let (job_id, key) = id_and_key_from_row(row).map_err(|e| map_sqlx_error("select_expired_blocked", e))?;
            job_ids.push(job_id);
            keys.extend(key);
        }
        lock_keys(&mut tx, keys.iter().map(String::as_str)).await?;

        let mut released = 0;
        for job_id in job_ids {
            // 競合で既に解放済みなら 0 行（no-op）
            let row = sqlx::query(
                r#"
                DELETE FROM spool_blocked_executions
                 WHERE job_id = $1 AND expires_at <= $2
                RETURNING job_id, queue_name, priority
                "#,
            )
            .bind(job_id.to_uuid())
            .bind(now)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_blocked", e))?;

            let Some(row) = row else {
                continue;
            };
            let (job_id, queue_name, priority) =
                blocked_from_row(&row).map_err(|e| map_sqlx_error("delete_blocked", e))?;
            insert_ready(&mut tx, job_id, &queue_name, priority, now).await?;
            released += 1;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        if released > 0 {
            info!(event = "release_many_blocked", released, "released expired blocked jobs");
        }
        Ok(released)
    }

    #[instrument(skip(self, process), fields(kind = %process.kind, hostname = %process.hostname, pid = process.pid), err)]
    async fn register_process(&self, process: NewProcess) -> Result<ProcessRecord, StoreError> {
        let record = ProcessRecord::from_new(self.ids.generate_process_id(), process, self.clock.now());

        sqlx::query(&format!(
            "INSERT INTO spool_processes ({PROCESS_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)"
        ))
        .bind(record.id.to_uuid())
        .bind(record.kind.as_str())
        .bind(&record.hostname)
        .bind(i64::from(record.pid))
        .bind(record.supervisor_id.map(|id| id.to_uuid()))
        .bind(&record.metadata)
        .bind(record.created_at)
        .bind(record.last_heartbeat_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("register_process", e))?;

        Ok(record)
    }

    async fn heartbeat(&self, process_id: ProcessId) -> Result<(), StoreError> {
        let updated = sqlx::query("UPDATE spool_processes SET last_heartbeat_at = $2 WHERE id = $1")
            .bind(process_id.to_uuid())
            .bind(self.clock.now())
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("heartbeat", e))?
            .rows_affected();

        if updated == 0 {
            return Err(StoreError::ProcessNotFound(process_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(process_id = %process_id), err)]
    async fn deregister_process(&self, process_id: ProcessId) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        sqlx::query("DELETE FROM spool_processes WHERE id = $1")
            .bind(process_id.to_uuid())
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_process", e))?;
        let released = release_claims(&mut tx, process_id, now).await?;

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(released)
    }

    #[instrument(name = "prune_processes", skip(self), err)]
    async fn prune_dead_processes(
        &self,
        alive_threshold: Duration,
        excluding: Option<ProcessId>,
    ) -> Result<Vec<PrunedProcess>, StoreError> {
        let now = self.clock.now();
        let cutoff = now
            - chrono::Duration::from_std(alive_threshold)
                .map_err(|e| StoreError::Database(format!("alive threshold out of range: {e}")))?;

        let candidates = sqlx::query(
            r#"
            SELECT id FROM spool_processes
             WHERE last_heartbeat_at < $1
               AND ($2::uuid IS NULL OR id <> $2)
             ORDER BY last_heartbeat_at ASC
            "#,
        )
        .bind(cutoff)
        .bind(excluding.map(|id| id.to_uuid()))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("select_dead_processes", e))?;

        let mut pruned = Vec::with_capacity(candidates.len());
        for row in candidates {
            let id: Uuid = row
                .try_get("id")
                .map_err(|e| map_sqlx_error("select_dead_processes", e))?;

            // 1 プロセスにつき 1 トランザクション。他の pruner と競合したら 0 行
            let mut tx = self
                .pool
                .begin()
                .await
                .map_err(|e| map_sqlx_error("begin_transaction", e))?;

            let deleted = sqlx::query(&format!(
                "DELETE FROM spool_processes WHERE id = $1 AND last_heartbeat_at < $2 RETURNING {PROCESS_COLUMNS}"
            ))
            .bind(id)
            .bind(cutoff)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("delete_process", e))?;

            let Some(deleted) = deleted else {
                tx.rollback()
                    .await
                    .map_err(|e| map_sqlx_error("rollback", e))?;
                continue;
            };
            let process = process_from_row(&deleted)?;
            let released = release_claims(&mut tx, process.id, now).await?;

            tx.commit()
                .await
                .map_err(|e| map_sqlx_error("commit_transaction", e))?;

            warn!(
                event = "prune_processes",
                process_id = %process.id,
                kind = %process.kind,
                hostname = %process.hostname,
                pid = process.pid,
                released,
                "pruned dead process"
            );
            pruned.push(PrunedProcess {
                id: process.id,
                kind: process.kind,
                hostname: process.hostname,
                pid: process.pid,
                released,
            });
        }

        Ok(pruned)
    }

    async fn processes(&self) -> Result<Vec<ProcessRecord>, StoreError> {
        let rows = sqlx::query(&format!("SELECT {PROCESS_COLUMNS} FROM spool_processes ORDER BY id"))
            .fetch_all(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_processes", e))?;
        rows.iter().map(process_from_row).collect()
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let rows = sqlx::query(
            "SELECT DISTINCT queue_name FROM spool_jobs WHERE finished_at IS NULL ORDER BY queue_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("queue_names", e))?;

        rows.iter()
            .map(|row| row.try_get("queue_name"))
            .collect::<Result<Vec<String>, _>>()
            .map_err(|e| map_sqlx_error("queue_names", e))
    }

    async fn queue_counts(&self) -> Result<Vec<QueueCounts>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT queue_name, 'scheduled' AS state, count(*) AS n FROM spool_scheduled_executions GROUP BY queue_name
            UNION ALL
            SELECT queue_name, 'ready', count(*) FROM spool_ready_executions GROUP BY queue_name
            UNION ALL
            SELECT j.queue_name, 'claimed', count(*) FROM spool_claimed_executions c
              JOIN spool_jobs j ON j.id = c.job_id GROUP BY j.queue_name
            UNION ALL
            SELECT queue_name, 'blocked', count(*) FROM spool_blocked_executions GROUP BY queue_name
            UNION ALL
            SELECT j.queue_name, 'failed', count(*) FROM spool_failed_executions f
              JOIN spool_jobs j ON j.id = f.job_id GROUP BY j.queue_name
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("queue_counts", e))?;

        let mut counts: BTreeMap<String, QueueCounts> = BTreeMap::new();
        for row in rows {
            let queue_name: String = row
                .try_get("queue_name")
                .map_err(|e| map_sqlx_error("queue_counts", e))?;
            let state: String = row
                .try_get("state")
                .map_err(|e| map_sqlx_error("queue_counts", e))?;
            let n = count_from_row(&row, "n")?;

            let entry = counts
                .entry(queue_name.clone())
                .or_insert_with(|| QueueCounts::new(queue_name));
            match JobState::parse(&state) {
                Some(JobState::Scheduled) => entry.scheduled += n,
                Some(JobState::Ready) => entry.ready += n,
                Some(JobState::Claimed) => entry.claimed += n,
                Some(JobState::Blocked) => entry.blocked += n,
                Some(JobState::Failed) => entry.failed += n,
                Some(JobState::Finished) | None => {}
            }
        }
        Ok(counts.into_values().collect())
    }

    #[instrument(skip(self), err)]
    async fn clear_queue(&self, queue_name: &str) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let rows = sqlx::query(
            r#"
            SELECT DISTINCT concurrency_key FROM spool_jobs
             WHERE queue_name = $1 AND finished_at IS NULL AND concurrency_key IS NOT NULL
            "#,
        )
        .bind(queue_name)
        .fetch_all(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("clear_queue", e))?;
        let keys = rows
            .iter()
            .map(|row| row.try_get("concurrency_key"))
            .collect::<Result<BTreeSet<String>, _>>()
            .map_err(|e| map_sqlx_error("clear_queue", e))?;
        lock_keys(&mut tx, keys.iter().map(String::as_str)).await?;

        for table in EXECUTION_TABLES {
            sqlx::query(&format!(
                "DELETE FROM {table} WHERE job_id IN \
                 (SELECT id FROM spool_jobs WHERE queue_name = $1 AND finished_at IS NULL)"
            ))
            .bind(queue_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("clear_queue", e))?;
        }

        let cleared = sqlx::query(
            r#"
            UPDATE spool_jobs SET finished_at = $2, updated_at = $2
             WHERE queue_name = $1 AND finished_at IS NULL
            "#,
        )
        .bind(queue_name)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("clear_queue", e))?
        .rows_affected();

        for key in &keys {
            self.release_next(&mut tx, key, now).await?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        info!(event = "discard", queue = queue_name, cleared, "cleared queue");
        Ok(cleared as usize)
    }

    async fn ready_count(&self, queues: &QueueSelector) -> Result<usize, StoreError> {
        let (names, patterns) = queue_filters(queues);
        let query = if names.is_empty() && patterns.is_empty() {
            sqlx::query("SELECT count(*) AS n FROM spool_ready_executions")
        } else {
            sqlx::query(
                r#"
                SELECT count(*) AS n FROM spool_ready_executions
                 WHERE queue_name = ANY($1) OR queue_name LIKE ANY($2)
                "#,
            )
            .bind(names)
            .bind(patterns)
        };
        let row = query
            .fetch_one(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("ready_count", e))?;
        count_from_row(&row, "n")
    }
}

const EXECUTION_TABLES: [&str; 5] = [
    "spool_scheduled_executions",
    "spool_ready_executions",
    "spool_claimed_executions",
    "spool_blocked_executions",
    "spool_failed_executions",
];

// ────────────────────────────────────────────────────────────
// free helpers
// ────────────────────────────────────────────────────────────

/// Takes the advisory locks for `keys` in sorted order; held until commit.
async fn lock_keys<'a>(
    conn: &mut PgConnection,
    keys: impl IntoIterator<Item = &'a str>,
) -> Result<(), StoreError> {
    let keys: BTreeSet<&str> = keys.into_iter().collect();
    for key in keys {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
            .bind(advisory_key(key))
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("lock_concurrency_key", e))?;
    }
    Ok(())
}

async fn try_lock_key(conn: &mut PgConnection, key: &str) -> Result<bool, StoreError> {
    let row = sqlx::query("SELECT pg_try_advisory_xact_lock(hashtextextended($1, 0)) AS locked")
        .bind(advisory_key(key))
        .fetch_one(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("try_lock_concurrency_key", e))?;
    row.try_get("locked")
        .map_err(|e| map_sqlx_error("try_lock_concurrency_key", e))
}

fn advisory_key(key: &str) -> String {
    format!("spool:concurrency:{key}")
}

/// Rows fetched per claim pass for `remaining` free slots. Keyed rows can be
/// skipped (key busy) or diverted to blocked, so the window is wider than the
/// batch; the claim stops once the batch is full.
fn candidate_window(remaining: usize) -> usize {
    remaining.saturating_mul(CLAIM_OVERFETCH)
}

async fn select_candidates(
    conn: &mut PgConnection,
    entry: &QueueEntry,
    limit: usize,
) -> Result<Vec<Candidate>, StoreError> {
    let (filter, param) = match entry {
        QueueEntry::All => ("TRUE", None),
        QueueEntry::Exact(name) => ("r.queue_name = $2", Some(name.clone())),
        QueueEntry::Prefix(prefix) => ("r.queue_name LIKE $2", Some(format!("{}%", escape_like(prefix)))),
    };

    let sql = format!(
        r#"
        SELECT r.job_id, r.queue_name, r.priority, j.concurrency_key
          FROM spool_ready_executions r
          JOIN spool_jobs j ON j.id = r.job_id
         WHERE {filter}
         ORDER BY r.priority ASC, r.job_id ASC
         LIMIT $1
         FOR UPDATE OF r SKIP LOCKED
        "#
    );
    let mut query = sqlx::query(&sql).bind(limit as i64);
    if let Some(param) = param {
        query = query.bind(param);
    }

    let rows = query
        .fetch_all(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("select_ready", e))?;

    rows.iter()
        .map(|row| -> Result<Candidate, sqlx::Error> {
            Ok(Candidate {
                job_id: JobId::from_uuid(row.try_get("job_id")?),
                queue_name: row.try_get("queue_name")?,
                priority: row.try_get("priority")?,
                concurrency_key: row.try_get("concurrency_key")?,
            })
        })
        .collect::<Result<_, _>>()
        .map_err(|e| map_sqlx_error("select_ready", e))
}

/// Compare-and-delete of one ready row.
async fn delete_ready(conn: &mut PgConnection, job_id: JobId) -> Result<bool, StoreError> {
    let deleted = sqlx::query("DELETE FROM spool_ready_executions WHERE job_id = $1")
        .bind(job_id.to_uuid())
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("delete_ready", e))?
        .rows_affected();
    Ok(deleted == 1)
}

async fn insert_ready(
    conn: &mut PgConnection,
    job_id: JobId,
    queue_name: &str,
    priority: i32,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO spool_ready_executions (job_id, queue_name, priority, created_at) VALUES ($1, $2, $3, $4)",
    )
    .bind(job_id.to_uuid())
    .bind(queue_name)
    .bind(priority)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_ready", e))?;
    Ok(())
}

async fn insert_blocked(
    conn: &mut PgConnection,
    job_id: JobId,
    queue_name: &str,
    priority: i32,
    key: &str,
    expires_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO spool_blocked_executions (job_id, queue_name, priority, concurrency_key, expires_at, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(job_id.to_uuid())
    .bind(queue_name)
    .bind(priority)
    .bind(key)
    .bind(expires_at)
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("insert_blocked", e))?;
    Ok(())
}

async fn delete_executions(conn: &mut PgConnection, job_id: JobId) -> Result<(), StoreError> {
    for table in EXECUTION_TABLES {
        sqlx::query(&format!("DELETE FROM {table} WHERE job_id = $1"))
            .bind(job_id.to_uuid())
            .execute(&mut *conn)
            .await
            .map_err(|e| map_sqlx_error("delete_execution", e))?;
    }
    Ok(())
}

async fn mark_finished(
    conn: &mut PgConnection,
    job_id: JobId,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    sqlx::query("UPDATE spool_jobs SET finished_at = $2, updated_at = $2 WHERE id = $1")
        .bind(job_id.to_uuid())
        .bind(now)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_sqlx_error("mark_finished", e))?;
    Ok(())
}

/// Moves every claim of `process_id` back to ready, keeping queue and priority.
async fn release_claims(
    conn: &mut PgConnection,
    process_id: ProcessId,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let released = sqlx::query(
        r#"
        WITH released AS (
            DELETE FROM spool_claimed_executions
             WHERE process_id = $1
            RETURNING job_id
        )
        INSERT INTO spool_ready_executions (job_id, queue_name, priority, created_at)
        SELECT j.id, j.queue_name, j.priority, $2
          FROM released r
          JOIN spool_jobs j ON j.id = r.job_id
        "#,
    )
    .bind(process_id.to_uuid())
    .bind(now)
    .execute(&mut *conn)
    .await
    .map_err(|e| map_sqlx_error("release_claimed", e))?
    .rows_affected();

    if released > 0 {
        info!(event = "release_claimed", process_id = %process_id, released, "released claimed executions");
    }
    Ok(released as usize)
}

/// Splits a selector into exact names and `LIKE` patterns. Both empty means
/// "every queue".
fn queue_filters(queues: &QueueSelector) -> (Vec<String>, Vec<String>) {
    let mut names = Vec::new();
    let mut patterns = Vec::new();
    for entry in queues.entries() {
        match entry {
            QueueEntry::All => return (Vec::new(), Vec::new()),
            QueueEntry::Exact(name) => names.push(name.clone()),
            QueueEntry::Prefix(prefix) => patterns.push(format!("{}%", escape_like(prefix))),
        }
    }
    (names, patterns)
}

fn escape_like(s: &str) -> String {
    s.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let decode = || -> Result<Job, sqlx::Error> {
        Ok(Job {
            id: JobId::from_uuid(row.try_get("id")?),
            queue_name: row.try_get("queue_name")?,
            class_name: row.try_get("class_name")?,
            arguments: row.try_get("arguments")?,
            priority: row.try_get("priority")?,
            scheduled_at: row.try_get("scheduled_at")?,
            concurrency_key: row.try_get("concurrency_key")?,
            finished_at: row.try_get("finished_at")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    };
    decode().map_err(|e| map_sqlx_error("decode_job", e))
}

fn process_from_row(row: &PgRow) -> Result<ProcessRecord, StoreError> {
    let kind: String = row
        .try_get("kind")
        .map_err(|e| map_sqlx_error("decode_process", e))?;
    let kind = ProcessKind::parse(&kind)
        .ok_or_else(|| StoreError::Serialization(format!("unknown process kind: {kind}")))?;
    let pid: i64 = row
        .try_get("pid")
        .map_err(|e| map_sqlx_error("decode_process", e))?;

    let decode = || -> Result<ProcessRecord, sqlx::Error> {
        Ok(ProcessRecord {
            id: ProcessId::from_uuid(row.try_get("id")?),
            kind,
            hostname: row.try_get("hostname")?,
            pid: u32::try_from(pid).unwrap_or_default(),
            supervisor_id: row
                .try_get::<Option<Uuid>, _>("supervisor_id")?
                .map(ProcessId::from_uuid),
            metadata: row.try_get("metadata")?,
            created_at: row.try_get("created_at")?,
            last_heartbeat_at: row.try_get("last_heartbeat_at")?,
        })
    };
    decode().map_err(|e| map_sqlx_error("decode_process", e))
}

fn blocked_from_row(row: &PgRow) -> Result<(JobId, String, i32), sqlx::Error> {
    Ok((
        JobId::from_uuid(row.try_get("job_id")?),
        row.try_get("queue_name")?,
        row.try_get("priority")?,
    ))
}

fn id_and_key_from_row(row: &PgRow) -> Result<(JobId, Option<String>), sqlx::Error> {
    Ok((
        JobId::from_uuid(row.try_get("job_id")?),
        row.try_get("concurrency_key")?,
    ))
}

fn count_from_row(row: &PgRow, column: &str) -> Result<usize, StoreError> {
    let n: i64 = row
        .try_get(column)
        .map_err(|e| map_sqlx_error("decode_count", e))?;
    Ok(usize::try_from(n).unwrap_or_default())
}

/// Map SQLx errors to `StoreError`, tagged with the failing operation.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => StoreError::Database(format!(
            "database error in {operation}: {} (code {})",
            db_err.message(),
            db_err.code().as_deref().unwrap_or("none"),
        )),
        sqlx::Error::PoolClosed => {
            StoreError::Database(format!("connection pool closed in {operation}"))
        }
        sqlx::Error::PoolTimedOut => {
            StoreError::Database(format!("connection pool timed out in {operation}"))
        }
        sqlx::Error::ColumnDecode { index, source } => StoreError::Serialization(format!(
            "failed to decode column {index} in {operation}: {source}"
        )),
        _ => StoreError::Database(format!("sqlx error in {operation}: {err}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::plain("mail", "mail")]
    #[case::underscore("mail_", "mail\\_")]
    #[case::percent("50%", "50\\%")]
    #[case::backslash("a\\b", "a\\\\b")]
    fn like_patterns_are_escaped(#[case] raw: &str, #[case] escaped: &str) {
        assert_eq!(escape_like(raw), escaped);
    }

    #[rstest]
    #[case::one(1, 2)]
    #[case::batch(5, 10)]
    #[case::saturates(usize::MAX, usize::MAX)]
    fn claim_window_overfetches(#[case] remaining: usize, #[case] window: usize) {
        assert_eq!(candidate_window(remaining), window);
    }

    #[test]
    fn queue_filters_split_exact_and_prefix_entries() {
        let (names, patterns) = queue_filters(&QueueSelector::parse("critical,mail_*"));
        assert_eq!(names, vec!["critical"]);
        assert_eq!(patterns, vec!["mail\\_%"]);
    }

    #[test]
    fn wildcard_selector_has_no_filters() {
        let (names, patterns) = queue_filters(&QueueSelector::parse("critical,*"));
        assert!(names.is_empty());
        assert!(patterns.is_empty());
    }

    #[test]
    fn schema_declares_the_introspection_indexes() {
        assert!(SCHEMA.contains("ON spool_ready_executions (priority, queue_name)"));
        assert!(SCHEMA.contains("ON spool_scheduled_executions (scheduled_at, priority)"));
    }
}
