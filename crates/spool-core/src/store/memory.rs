//! In-memory job store.
//!
//! Every operation takes the single state lock, so each transition is atomic
//! and claims partition the ready set trivially. Useful for tests and for
//! running the engine inside one OS process.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::concurrency::{
    self, ConcurrencyPolicy, Placement, StaticConcurrencyPolicy, admits,
};
use crate::domain::{
    BlockedExecution, ClaimedExecution, ClaimedJob, Completion, FailedExecution, Job, JobError,
    JobId, JobState, NewJob, NewProcess, ProcessId, ProcessRecord, PrunedProcess, QueueCounts,
    QueueSelector, ReadyExecution, ScheduledExecution,
};
use crate::error::StoreError;
use crate::ports::{Clock, IdGenerator, JobStore, SystemClock, UlidGenerator};

/// All rows. BTreeMaps keep iteration (and therefore tests) deterministic.
struct InMemoryState {
    jobs: BTreeMap<JobId, Job>,
    scheduled: BTreeMap<JobId, ScheduledExecution>,
    ready: BTreeMap<JobId, ReadyExecution>,
    claimed: BTreeMap<JobId, ClaimedExecution>,
    blocked: BTreeMap<JobId, BlockedExecution>,
    failed: BTreeMap<JobId, FailedExecution>,
    processes: BTreeMap<ProcessId, ProcessRecord>,
}

impl InMemoryState {
    fn new() -> Self {
        Self {
            jobs: BTreeMap::new(),
            scheduled: BTreeMap::new(),
            ready: BTreeMap::new(),
            claimed: BTreeMap::new(),
            blocked: BTreeMap::new(),
            failed: BTreeMap::new(),
            processes: BTreeMap::new(),
        }
    }

    fn job(&self, job_id: JobId) -> Result<&Job, StoreError> {
        self.jobs.get(&job_id).ok_or(StoreError::JobNotFound(job_id))
    }

    fn state_of(&self, job_id: JobId) -> Result<JobState, StoreError> {
        let job = self.job(job_id)?;
        let state = if job.is_finished() {
            JobState::Finished
        } else if self.scheduled.contains_key(&job_id) {
            JobState::Scheduled
        } else if self.ready.contains_key(&job_id) {
            JobState::Ready
        } else if self.claimed.contains_key(&job_id) {
            JobState::Claimed
        } else if self.blocked.contains_key(&job_id) {
            JobState::Blocked
        } else if self.failed.contains_key(&job_id) {
            JobState::Failed
        } else {
            return Err(StoreError::Database(format!("job {job_id} has no execution row")));
        };
        Ok(state)
    }

    fn has_key(&self, job_id: &JobId, key: &str) -> bool {
        self.jobs
            .get(job_id)
            .and_then(|j| j.concurrency_key.as_deref())
            == Some(key)
    }

    /// Ready + claimed jobs holding `key`.
    fn admitted(&self, key: &str) -> usize {
        self.ready.keys().filter(|id| self.has_key(id, key)).count() + self.running(key)
    }

    /// Claimed jobs holding `key`.
    fn running(&self, key: &str) -> usize {
        self.claimed.keys().filter(|id| self.has_key(id, key)).count()
    }

    /// Inserts the execution row for a job that currently has none.
    fn place(
        &mut self,
        job_id: JobId,
        policy: &dyn ConcurrencyPolicy,
        now: DateTime<Utc>,
    ) -> Result<JobState, StoreError> {
        let job = self.job(job_id)?.clone();

        if let Some(at) = job.scheduled_at.filter(|_| !job.is_due(now)) {
            self.scheduled.insert(
                job_id,
                ScheduledExecution {
                    job_id,
                    queue_name: job.queue_name.clone(),
                    priority: job.priority,
                    scheduled_at: at,
                    created_at: now,
                },
            );
            return Ok(JobState::Scheduled);
        }

        Ok(self.gate(&job, policy, now))
    }

    /// Ready or blocked, per the key's admitted count.
    fn gate(&mut self, job: &Job, policy: &dyn ConcurrencyPolicy, now: DateTime<Utc>) -> JobState {
        if let Some(key) = job.concurrency_key.as_deref() {
            let limit = policy.limit_for(key);
            if let Placement::Blocked { expires_at } =
                concurrency::placement(self.admitted(key), &limit, now)
            {
                self.block(job, key, expires_at, now);
                return JobState::Blocked;
            }
        }

        self.ready.insert(job.id, ReadyExecution::for_job(job, now));
        JobState::Ready
    }

    fn block(&mut self, job: &Job, key: &str, expires_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.blocked.insert(
            job.id,
            BlockedExecution {
                job_id: job.id,
                queue_name: job.queue_name.clone(),
                priority: job.priority,
                concurrency_key: key.to_string(),
                expires_at,
                created_at: now,
            },
        );
    }

    /// Removes whichever execution row represents the job.
    fn remove_execution(&mut self, job_id: JobId) {
        self.scheduled.remove(&job_id);
        self.ready.remove(&job_id);
        self.claimed.remove(&job_id);
        self.blocked.remove(&job_id);
        self.failed.remove(&job_id);
    }

    fn unblock(&mut self, job_id: JobId, now: DateTime<Utc>) -> bool {
        let Some(blocked) = self.blocked.remove(&job_id) else {
            return false;
        };
        self.ready.insert(
            job_id,
            ReadyExecution {
                job_id,
                queue_name: blocked.queue_name,
                priority: blocked.priority,
                created_at: now,
            },
        );
        true
    }

    /// Promotes the oldest blocked job of `key` while the key has capacity.
    fn release_blocked(
        &mut self,
        key: &str,
        policy: &dyn ConcurrencyPolicy,
        now: DateTime<Utc>,
    ) -> Option<JobId> {
        if !admits(self.admitted(key), &policy.limit_for(key)) {
            return None;
        }

        let next = self
            .blocked
            .values()
            .filter(|b| b.concurrency_key == key)
            .min_by_key(|b| b.release_order())
            .map(|b| b.job_id)?;

        self.unblock(next, now);
        debug!(event = "release_blocked", job_id = %next, concurrency_key = key, "unblocked job");
        Some(next)
    }

    /// Moves every claim of `process_id` back to ready.
    fn release_claims(&mut self, process_id: ProcessId, now: DateTime<Utc>) -> usize {
        let owned: Vec<JobId> = self
            .claimed
            .values()
            .filter(|c| c.process_id == process_id)
            .map(|c| c.job_id)
            .collect();

        for job_id in &owned {
            self.claimed.remove(job_id);
            if let Some(job) = self.jobs.get(job_id) {
                self.ready.insert(*job_id, ReadyExecution::for_job(job, now));
            }
        }
        owned.len()
    }

    fn queue_of(&self, job_id: &JobId) -> Option<&str> {
        self.jobs.get(job_id).map(|j| j.queue_name.as_str())
    }
}

fn counts_for<'a>(counts: &'a mut BTreeMap<String, QueueCounts>, queue: &str) -> &'a mut QueueCounts {
    counts
        .entry(queue.to_string())
        .or_insert_with(|| QueueCounts::new(queue))
}

/// In-memory `JobStore`.
pub struct InMemoryJobStore {
    state: Mutex<InMemoryState>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    policy: Arc<dyn ConcurrencyPolicy>,
}

impl InMemoryJobStore {
    pub fn new(
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        policy: Arc<dyn ConcurrencyPolicy>,
    ) -> Self {
        Self {
            state: Mutex::new(InMemoryState::new()),
            clock,
            ids,
            policy,
        }
    }

    /// Store with default concurrency limits, ids drawn from `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        let ids = Arc::new(UlidGenerator::new(clock.clone()));
        Self::new(clock, ids, Arc::new(StaticConcurrencyPolicy::default()))
    }

    pub fn with_policy(mut self, policy: Arc<dyn ConcurrencyPolicy>) -> Self {
        self.policy = policy;
        self
    }

    /// Finishes or fails a claim; shared by `finish` and `fail`.
    async fn complete(
        &self,
        job_id: JobId,
        process_id: ProcessId,
        error: Option<JobError>,
    ) -> Result<Completion, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let key = state.job(job_id)?.concurrency_key.clone();

        match state.claimed.get(&job_id) {
            Some(claim) if claim.process_id == process_id => {}
            _ => return Ok(Completion::Stale),
        }
        state.claimed.remove(&job_id);

        match error {
            None => {
                if let Some(job) = state.jobs.get_mut(&job_id) {
                    job.mark_finished(now);
                }
            }
            Some(error) => {
                state.failed.insert(
                    job_id,
                    FailedExecution {
                        job_id,
                        error,
                        created_at: now,
                    },
                );
            }
        }

        if let Some(key) = key {
            state.release_blocked(&key, self.policy.as_ref(), now);
        }
        Ok(Completion::Recorded)
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn submit(&self, new_job: NewJob) -> Result<JobId, StoreError> {
        let now = self.clock.now();
        let job_id = self.ids.generate_job_id();
        let mut state = self.state.lock().await;

        state.jobs.insert(job_id, Job::from_new(job_id, new_job, now));
        state.place(job_id, self.policy.as_ref(), now)?;
        Ok(job_id)
    }

    async fn job(&self, job_id: JobId) -> Result<Job, StoreError> {
        let state = self.state.lock().await;
        state.job(job_id).cloned()
    }

    async fn job_state(&self, job_id: JobId) -> Result<JobState, StoreError> {
        let state = self.state.lock().await;
        state.state_of(job_id)
    }

    async fn failed_execution(&self, job_id: JobId) -> Result<Option<FailedExecution>, StoreError> {
        let state = self.state.lock().await;
        state.job(job_id)?;
        Ok(state.failed.get(&job_id).cloned())
    }

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
        let mut state = self.state.lock().await;

        let mut candidates: Vec<(usize, (i32, JobId))> = state
            .ready
            .values()
            .filter_map(|r| queues.rank(&r.queue_name).map(|rank| (rank, r.claim_order())))
            .collect();
        candidates.sort();

        let mut claimed = Vec::new();
        for (_, (_, job_id)) in candidates {
            if claimed.len() >= limit {
                break;
            }
            let job = state.job(job_id)?.clone();

            if let Some(key) = job.concurrency_key.as_deref() {
                let key_limit = self.policy.limit_for(key);
                if !admits(state.running(key), &key_limit) {
                    state.ready.remove(&job_id);
                    state.block(&job, key, concurrency::after(now, key_limit.blocked_for), now);
                    debug!(job_id = %job_id, concurrency_key = key, "claim diverted job to blocked");
                    continue;
                }
            }

            state.ready.remove(&job_id);
            state.claimed.insert(
                job_id,
                ClaimedExecution {
                    job_id,
                    process_id,
                    created_at: now,
                },
            );
            claimed.push(ClaimedJob {
                job,
                process_id,
                claimed_at: now,
            });
        }

        Ok(claimed)
    }

    async fn finish(&self, job_id: JobId, process_id: ProcessId) -> Result<Completion, StoreError> {
        self.complete(job_id, process_id, None).await
    }

    async fn fail(
        &self,
        job_id: JobId,
        process_id: ProcessId,
        error: JobError,
    ) -> Result<Completion, StoreError> {
        self.complete(job_id, process_id, Some(error)).await
    }

    async fn discard(&self, job_id: JobId) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let from = state.state_of(job_id)?;
        if from.is_terminal() {
            return Err(StoreError::InvalidTransition {
                job_id,
                from,
                action: "discard",
            });
        }

        state.remove_execution(job_id);
        let key = match state.jobs.get_mut(&job_id) {
            Some(job) => {
                job.mark_finished(now);
                job.concurrency_key.clone()
            }
            None => None,
        };
        if let Some(key) = key {
            state.release_blocked(&key, self.policy.as_ref(), now);
        }
        Ok(())
    }

    async fn retry(&self, job_id: JobId) -> Result<JobState, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let from = state.state_of(job_id)?;
        if from != JobState::Failed {
            return Err(StoreError::InvalidTransition {
                job_id,
                from,
                action: "retry",
            });
        }

        state.failed.remove(&job_id);
        state.place(job_id, self.policy.as_ref(), now)
    }

    async fn dispatch_scheduled(&self, batch_size: usize) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let mut due: Vec<&ScheduledExecution> =
            state.scheduled.values().filter(|s| s.scheduled_at <= now).collect();
        due.sort_by_key(|s| (s.scheduled_at, s.priority, s.job_id));
        let due: Vec<JobId> = due.into_iter().take(batch_size).map(|s| s.job_id).collect();

        for job_id in &due {
            state.scheduled.remove(job_id);
            let job = state.job(*job_id)?.clone();
            state.gate(&job, self.policy.as_ref(), now);
        }
        Ok(due.len())
    }

    async fn release_blocked(&self, concurrency_key: &str) -> Result<Option<JobId>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.release_blocked(concurrency_key, self.policy.as_ref(), now))
    }

    async fn release_expired_blocked(&self, limit: usize) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let mut expired: Vec<&BlockedExecution> =
            state.blocked.values().filter(|b| b.expires_at <= now).collect();
        expired.sort_by_key(|b| b.release_order());
        let expired: Vec<JobId> = expired.into_iter().take(limit).map(|b| b.job_id).collect();

        for job_id in &expired {
            state.unblock(*job_id, now);
        }
        Ok(expired.len())
    }

    async fn register_process(&self, process: NewProcess) -> Result<ProcessRecord, StoreError> {
        let now = self.clock.now();
        let record = ProcessRecord::from_new(self.ids.generate_process_id(), process, now);
        let mut state = self.state.lock().await;
        state.processes.insert(record.id, record.clone());
        Ok(record)
    }

    async fn heartbeat(&self, process_id: ProcessId) -> Result<(), StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let process = state
            .processes
            .get_mut(&process_id)
            .ok_or(StoreError::ProcessNotFound(process_id))?;
        process.last_heartbeat_at = now;
        Ok(())
    }

    async fn deregister_process(&self, process_id: ProcessId) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.processes.remove(&process_id);
        Ok(state.release_claims(process_id, now))
    }

    async fn prune_dead_processes(
        &self,
        alive_threshold: Duration,
        excluding: Option<ProcessId>,
    ) -> Result<Vec<PrunedProcess>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let dead: Vec<ProcessRecord> = state
            .processes
            .values()
            .filter(|p| Some(p.id) != excluding && !p.is_alive(now, alive_threshold))
            .cloned()
            .collect();

        let mut pruned = Vec::with_capacity(dead.len());
        for process in dead {
            state.processes.remove(&process.id);
            let released = state.release_claims(process.id, now);
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
        let state = self.state.lock().await;
        Ok(state.processes.values().cloned().collect())
    }

    async fn queue_names(&self) -> Result<Vec<String>, StoreError> {
        let state = self.state.lock().await;
        let names: BTreeSet<String> = state
            .jobs
            .values()
            .filter(|j| !j.is_finished())
            .map(|j| j.queue_name.clone())
            .collect();
        Ok(names.into_iter().collect())
    }

    async fn queue_counts(&self) -> Result<Vec<QueueCounts>, StoreError> {
        let state = self.state.lock().await;
        let mut counts: BTreeMap<String, QueueCounts> = BTreeMap::new();

        for s in state.scheduled.values() {
            counts_for(&mut counts, &s.queue_name).scheduled += 1;
        }
        for r in state.ready.values() {
            counts_for(&mut counts, &r.queue_name).ready += 1;
        }
        for job_id in state.claimed.keys() {
            if let Some(queue) = state.queue_of(job_id) {
                counts_for(&mut counts, queue).claimed += 1;
            }
        }
        for b in state.blocked.values() {
            counts_for(&mut counts, &b.queue_name).blocked += 1;
        }
        for job_id in state.failed.keys() {
            if let Some(queue) = state.queue_of(job_id) {
                counts_for(&mut counts, queue).failed += 1;
            }
        }

        Ok(counts.into_values().collect())
    }

    async fn clear_queue(&self, queue_name: &str) -> Result<usize, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let doomed: Vec<JobId> = state
            .jobs
            .values()
            .filter(|j| j.queue_name == queue_name && !j.is_finished())
            .map(|j| j.id)
            .collect();

        let mut keys = BTreeSet::new();
        for job_id in &doomed {
            state.remove_execution(*job_id);
            if let Some(job) = state.jobs.get_mut(job_id) {
                job.mark_finished(now);
                keys.extend(job.concurrency_key.clone());
            }
        }
        for key in keys {
            state.release_blocked(&key, self.policy.as_ref(), now);
        }
        Ok(doomed.len())
    }

    async fn ready_count(&self, queues: &QueueSelector) -> Result<usize, StoreError> {
        let state = self.state.lock().await;
        Ok(state.ready.values().filter(|r| queues.matches(&r.queue_name)).count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::ConcurrencyLimit;
    use crate::domain::ProcessKind;
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use rstest::{fixture, rstest};
    use serde_json::json;
    use std::collections::HashSet;

    struct Harness {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryJobStore>,
    }

    impl Harness {
        fn with_limit(limit: u32) -> Self {
            let start = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
            let clock = Arc::new(FixedClock::new(start));
            let policy = StaticConcurrencyPolicy::new(ConcurrencyLimit::new(
                limit,
                Duration::from_secs(180),
            ));
            let store = InMemoryJobStore::with_clock(clock.clone()).with_policy(Arc::new(policy));
            Self {
                clock,
                store: Arc::new(store),
            }
        }

        async fn register(&self, kind: ProcessKind) -> ProcessId {
            self.store
                .register_process(NewProcess::current(kind, json!({})))
                .await
                .unwrap()
                .id
        }

        async fn state(&self, job_id: JobId) -> JobState {
            self.store.job_state(job_id).await.unwrap()
        }
    }

    #[fixture]
    fn harness() -> Harness {
        Harness::with_limit(1)
    }

    fn job(class: &str) -> NewJob {
        NewJob::new(class, json!({}))
    }

    #[rstest]
    #[tokio::test]
    async fn submission_places_job_by_schedule(harness: Harness) {
        let now = harness.clock.now();
        let ready = harness.store.submit(job("a")).await.unwrap();
        let past = harness
            .store
            .submit(job("b").scheduled_at(now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        let future = harness
            .store
            .submit(job("c").scheduled_at(now + chrono::Duration::minutes(1)))
            .await
            .unwrap();

        assert_eq!(harness.state(ready).await, JobState::Ready);
        assert_eq!(harness.state(past).await, JobState::Ready);
        assert_eq!(harness.state(future).await, JobState::Scheduled);
    }

    #[rstest]
    #[tokio::test]
    async fn claim_orders_by_priority_then_age(harness: Harness) {
        let low = harness.store.submit(job("low").with_priority(10)).await.unwrap();
        let first = harness.store.submit(job("first")).await.unwrap();
        let second = harness.store.submit(job("second")).await.unwrap();
        let urgent = harness.store.submit(job("urgent").with_priority(-5)).await.unwrap();
        let worker = harness.register(ProcessKind::Worker).await;

        let claimed = harness.store.claim(&QueueSelector::all(), 10, worker).await.unwrap();
        let order: Vec<JobId> = claimed.iter().map(|c| c.job.id).collect();
        assert_eq!(order, vec![urgent, first, second, low]);
    }

    #[rstest]
    #[tokio::test]
    async fn claim_serves_queue_list_in_order(harness: Harness) {
        let background = harness
            .store
            .submit(job("a").on_queue("background").with_priority(-100))
            .await
            .unwrap();
        let mail = harness.store.submit(job("b").on_queue("mail_digest")).await.unwrap();
        let critical = harness.store.submit(job("c").on_queue("critical").with_priority(50)).await.unwrap();
        let ignored = harness.store.submit(job("d").on_queue("reports")).await.unwrap();
        let worker = harness.register(ProcessKind::Worker).await;

        let queues = QueueSelector::parse("critical,mail_*,background");
        let claimed = harness.store.claim(&queues, 10, worker).await.unwrap();
        let order: Vec<JobId> = claimed.iter().map(|c| c.job.id).collect();

        assert_eq!(order, vec![critical, mail, background]);
        assert_eq!(harness.state(ignored).await, JobState::Ready);
    }

    #[rstest]
    #[tokio::test]
    async fn claim_returns_empty_when_nothing_is_ready(harness: Harness) {
        let worker = harness.register(ProcessKind::Worker).await;
        let claimed = harness.store.claim(&QueueSelector::all(), 5, worker).await.unwrap();
        assert!(claimed.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_claims_partition_the_ready_set() {
        let harness = Harness::with_limit(1);
        let mut submitted = HashSet::new();
        for i in 0..200 {
            submitted.insert(harness.store.submit(job(&format!("job-{i}"))).await.unwrap());
        }

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let store = harness.store.clone();
            let worker = harness.register(ProcessKind::Worker).await;
            tasks.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim(&QueueSelector::all(), 7, worker).await.unwrap();
                    if batch.is_empty() {
                        break mine;
                    }
                    mine.extend(batch.into_iter().map(|c| c.job.id));
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut seen = HashSet::new();
        for task in tasks {
            for job_id in task.await.unwrap() {
                assert!(seen.insert(job_id), "{job_id} claimed twice");
            }
        }
        assert_eq!(seen, submitted);
    }

    #[rstest]
    #[tokio::test]
    async fn second_job_of_a_key_waits_blocked_until_the_first_finishes(harness: Harness) {
        let a = harness.store.submit(job("a").with_concurrency_key("k")).await.unwrap();
        let b = harness.store.submit(job("b").with_concurrency_key("k")).await.unwrap();
        let worker = harness.register(ProcessKind::Worker).await;

        let claimed = harness.store.claim(&QueueSelector::all(), 1, worker).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].job.id, a);
        assert_eq!(harness.state(b).await, JobState::Blocked);

        let completion = harness.store.finish(a, worker).await.unwrap();
        assert_eq!(completion, Completion::Recorded);
        assert_eq!(harness.state(a).await, JobState::Finished);
        assert_eq!(harness.state(b).await, JobState::Ready);
    }

    #[rstest]
    #[tokio::test]
    async fn failing_a_job_also_releases_its_key(harness: Harness) {
        let a = harness.store.submit(job("a").with_concurrency_key("k")).await.unwrap();
        let b = harness.store.submit(job("b").with_concurrency_key("k")).await.unwrap();
        let worker = harness.register(ProcessKind::Worker).await;
        harness.store.claim(&QueueSelector::all(), 1, worker).await.unwrap();

        harness
            .store
            .fail(a, worker, JobError::new("RuntimeError", "boom"))
            .await
            .unwrap();

        assert_eq!(harness.state(a).await, JobState::Failed);
        assert_eq!(harness.state(b).await, JobState::Ready);
        let failed = harness.store.failed_execution(a).await.unwrap().unwrap();
        assert_eq!(failed.error.message, "boom");
    }

    #[tokio::test]
    async fn running_jobs_never_exceed_the_key_limit() {
        let harness = Harness::with_limit(2);
        let mut ids = Vec::new();
        for i in 0..6 {
            ids.push(
                harness
                    .store
                    .submit(job(&format!("j{i}")).with_concurrency_key("tenant/1"))
                    .await
                    .unwrap(),
            );
        }

        // expiry releases everything blocked, over the limit
        harness.clock.advance(Duration::from_secs(181));
        assert_eq!(harness.store.release_expired_blocked(100).await.unwrap(), 4);
        assert_eq!(harness.store.ready_count(&QueueSelector::all()).await.unwrap(), 6);

        let worker = harness.register(ProcessKind::Worker).await;
        let claimed = harness.store.claim(&QueueSelector::all(), 6, worker).await.unwrap();
        assert_eq!(claimed.len(), 2);

        let blocked = count_in_state(&harness, &ids, JobState::Blocked).await;
        assert_eq!(blocked, 4);

        // the limit holds through finish/claim cycles
        for c in claimed {
            harness.store.finish(c.job.id, worker).await.unwrap();
        }
        let claimed = harness.store.claim(&QueueSelector::all(), 6, worker).await.unwrap();
        assert_eq!(claimed.len(), 2);
    }

    async fn count_in_state(harness: &Harness, ids: &[JobId], expected: JobState) -> usize {
        let mut n = 0;
        for id in ids {
            if harness.state(*id).await == expected {
                n += 1;
            }
        }
        n
    }

    #[rstest]
    #[tokio::test]
    async fn expiry_sweep_is_idempotent(harness: Harness) {
        harness.store.submit(job("a").with_concurrency_key("k")).await.unwrap();
        harness.store.submit(job("b").with_concurrency_key("k")).await.unwrap();
        harness.store.submit(job("c").with_concurrency_key("k")).await.unwrap();

        assert_eq!(harness.store.release_expired_blocked(10).await.unwrap(), 0);

        harness.clock.advance(Duration::from_secs(181));
        assert_eq!(harness.store.release_expired_blocked(1).await.unwrap(), 1);
        assert_eq!(harness.store.release_expired_blocked(10).await.unwrap(), 1);
        assert_eq!(harness.store.release_expired_blocked(10).await.unwrap(), 0);
    }

    #[rstest]
    #[tokio::test]
    async fn release_blocked_is_a_no_op_without_capacity(harness: Harness) {
        harness.store.submit(job("a").with_concurrency_key("k")).await.unwrap();
        let b = harness.store.submit(job("b").with_concurrency_key("k")).await.unwrap();

        assert_eq!(harness.store.release_blocked("k").await.unwrap(), None);
        assert_eq!(harness.state(b).await, JobState::Blocked);
        assert_eq!(harness.store.release_blocked("other").await.unwrap(), None);
    }

    #[rstest]
    #[tokio::test]
    async fn pruning_a_dead_worker_returns_its_claims_to_ready(harness: Harness) {
        for i in 0..5 {
            harness.store.submit(job(&format!("j{i}")).with_priority(i)).await.unwrap();
        }
        let dead = harness.register(ProcessKind::Worker).await;
        let dispatcher = harness.register(ProcessKind::Dispatcher).await;
        let claimed = harness.store.claim(&QueueSelector::all(), 3, dead).await.unwrap();
        assert_eq!(claimed.len(), 3);

        harness.clock.advance(Duration::from_secs(301));
        harness.store.heartbeat(dispatcher).await.unwrap();

        let pruned = harness
            .store
            .prune_dead_processes(Duration::from_secs(300), Some(dispatcher))
            .await
            .unwrap();

        assert_eq!(pruned.len(), 1);
        assert_eq!(pruned[0].id, dead);
        assert_eq!(pruned[0].released, 3);
        assert_eq!(harness.store.ready_count(&QueueSelector::all()).await.unwrap(), 5);
        for c in &claimed {
            assert_eq!(harness.state(c.job.id).await, JobState::Ready);
        }

        let processes = harness.store.processes().await.unwrap();
        assert_eq!(processes.iter().map(|p| p.id).collect::<Vec<_>>(), vec![dispatcher]);
        assert!(matches!(
            harness.store.heartbeat(dead).await,
            Err(StoreError::ProcessNotFound(id)) if id == dead
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn pruning_never_removes_the_caller(harness: Harness) {
        let me = harness.register(ProcessKind::Dispatcher).await;
        harness.clock.advance(Duration::from_secs(1_000));

        let pruned = harness
            .store
            .prune_dead_processes(Duration::from_secs(300), Some(me))
            .await
            .unwrap();
        assert!(pruned.is_empty());
        assert_eq!(harness.store.processes().await.unwrap().len(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn supervisor_reference_is_lookup_only(harness: Harness) {
        let supervisor = harness.register(ProcessKind::Dispatcher).await;
        let child = harness
            .store
            .register_process(
                NewProcess::current(ProcessKind::Worker, json!({})).supervised_by(supervisor),
            )
            .await
            .unwrap();
        assert_eq!(child.supervisor_id, Some(supervisor));

        harness.clock.advance(Duration::from_secs(301));
        harness.store.heartbeat(child.id).await.unwrap();
        let pruned = harness
            .store
            .prune_dead_processes(Duration::from_secs(300), Some(child.id))
            .await
            .unwrap();

        assert_eq!(pruned.iter().map(|p| p.id).collect::<Vec<_>>(), vec![supervisor]);
        let processes = harness.store.processes().await.unwrap();
        assert_eq!(processes.len(), 1);
        assert_eq!(processes[0].supervisor_id, Some(supervisor));
    }

    #[rstest]
    #[tokio::test]
    async fn late_finish_after_reclaim_is_stale(harness: Harness) {
        let a = harness.store.submit(job("a")).await.unwrap();
        let worker = harness.register(ProcessKind::Worker).await;
        harness.store.claim(&QueueSelector::all(), 1, worker).await.unwrap();

        assert_eq!(harness.store.deregister_process(worker).await.unwrap(), 1);
        assert_eq!(harness.state(a).await, JobState::Ready);

        assert_eq!(harness.store.finish(a, worker).await.unwrap(), Completion::Stale);
        assert_eq!(harness.state(a).await, JobState::Ready);
    }

    #[rstest]
    #[tokio::test]
    async fn round_trip_leaves_only_a_finished_job(harness: Harness) {
        let now = harness.clock.now();
        let a = harness
            .store
            .submit(job("a").scheduled_at(now + chrono::Duration::seconds(30)))
            .await
            .unwrap();
        let worker = harness.register(ProcessKind::Worker).await;

        harness.clock.advance(Duration::from_secs(31));
        assert_eq!(harness.store.dispatch_scheduled(500).await.unwrap(), 1);
        let claimed = harness.store.claim(&QueueSelector::all(), 1, worker).await.unwrap();
        assert_eq!(claimed[0].job.id, a);
        harness.store.finish(a, worker).await.unwrap();

        assert_eq!(harness.state(a).await, JobState::Finished);
        assert!(harness.store.job(a).await.unwrap().finished_at.is_some());
        assert!(harness.store.queue_counts().await.unwrap().is_empty());
    }

    #[rstest]
    #[tokio::test]
    async fn dispatcher_promotes_only_due_jobs(harness: Harness) {
        let now = harness.clock.now();
        let a = harness
            .store
            .submit(job("a").scheduled_at(now + chrono::Duration::minutes(10)))
            .await
            .unwrap();

        harness.clock.set(now + chrono::Duration::minutes(5));
        assert_eq!(harness.store.dispatch_scheduled(500).await.unwrap(), 0);
        assert_eq!(harness.state(a).await, JobState::Scheduled);

        harness.clock.set(now + chrono::Duration::minutes(11));
        assert_eq!(harness.store.dispatch_scheduled(500).await.unwrap(), 1);
        assert_eq!(harness.state(a).await, JobState::Ready);
    }

    #[rstest]
    #[tokio::test]
    async fn dispatch_respects_batch_size_and_the_gate(harness: Harness) {
        let now = harness.clock.now();
        let at = now + chrono::Duration::seconds(5);
        let a = harness.store.submit(job("a").scheduled_at(at).with_concurrency_key("k")).await.unwrap();
        let b = harness.store.submit(job("b").scheduled_at(at).with_concurrency_key("k")).await.unwrap();
        let c = harness.store.submit(job("c").scheduled_at(at)).await.unwrap();

        harness.clock.advance(Duration::from_secs(6));
        assert_eq!(harness.store.dispatch_scheduled(2).await.unwrap(), 2);
        assert_eq!(harness.state(c).await, JobState::Scheduled);
        assert_eq!(harness.store.dispatch_scheduled(2).await.unwrap(), 1);

        assert_eq!(harness.state(a).await, JobState::Ready);
        assert_eq!(harness.state(b).await, JobState::Blocked);
        assert_eq!(harness.state(c).await, JobState::Ready);
    }

    #[rstest]
    #[case::scheduled(true)]
    #[case::ready(false)]
    #[tokio::test]
    async fn discard_finishes_unfinished_jobs(harness: Harness, #[case] scheduled: bool) {
        let mut new_job = job("a");
        if scheduled {
            new_job = new_job.scheduled_at(harness.clock.now() + chrono::Duration::hours(1));
        }
        let a = harness.store.submit(new_job).await.unwrap();

        harness.store.discard(a).await.unwrap();
        assert_eq!(harness.state(a).await, JobState::Finished);

        let err = harness.store.discard(a).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition { from: JobState::Finished, action: "discard", .. }
        ));
    }

    #[rstest]
    #[tokio::test]
    async fn discarding_a_running_job_makes_its_finish_stale(harness: Harness) {
        let a = harness.store.submit(job("a").with_concurrency_key("k")).await.unwrap();
        let b = harness.store.submit(job("b").with_concurrency_key("k")).await.unwrap();
        let worker = harness.register(ProcessKind::Worker).await;
        harness.store.claim(&QueueSelector::all(), 1, worker).await.unwrap();

        harness.store.discard(a).await.unwrap();
        assert_eq!(harness.state(b).await, JobState::Ready);
        assert_eq!(harness.store.finish(a, worker).await.unwrap(), Completion::Stale);
    }

    #[rstest]
    #[tokio::test]
    async fn retry_goes_back_through_the_gate(harness: Harness) {
        let a = harness.store.submit(job("a").with_concurrency_key("k")).await.unwrap();
        let worker = harness.register(ProcessKind::Worker).await;
        harness.store.claim(&QueueSelector::all(), 1, worker).await.unwrap();
        harness.store.fail(a, worker, JobError::new("E", "x")).await.unwrap();

        let b = harness.store.submit(job("b").with_concurrency_key("k")).await.unwrap();
        assert_eq!(harness.state(b).await, JobState::Ready);

        assert_eq!(harness.store.retry(a).await.unwrap(), JobState::Blocked);
        assert!(harness.store.failed_execution(a).await.unwrap().is_none());

        let err = harness.store.retry(b).await.unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { action: "retry", .. }));
    }

    #[rstest]
    #[tokio::test]
    async fn queue_counts_and_clear_queue(harness: Harness) {
        let now = harness.clock.now();
        harness.store.submit(job("a").on_queue("mail")).await.unwrap();
        harness
            .store
            .submit(job("b").on_queue("mail").scheduled_at(now + chrono::Duration::hours(1)))
            .await
            .unwrap();
        harness.store.submit(job("c").on_queue("mail").with_concurrency_key("k")).await.unwrap();
        harness.store.submit(job("d").on_queue("mail").with_concurrency_key("k")).await.unwrap();
        harness.store.submit(job("e")).await.unwrap();

        assert_eq!(harness.store.queue_names().await.unwrap(), vec!["default", "mail"]);

        let counts = harness.store.queue_counts().await.unwrap();
        let mail = counts.iter().find(|c| c.queue_name == "mail").unwrap();
        assert_eq!((mail.ready, mail.scheduled, mail.blocked), (2, 1, 1));
        assert_eq!(mail.pending(), 4);

        assert_eq!(harness.store.clear_queue("mail").await.unwrap(), 4);
        assert_eq!(harness.store.queue_names().await.unwrap(), vec!["default"]);
        assert_eq!(harness.store.ready_count(&QueueSelector::parse("mail")).await.unwrap(), 0);
        assert_eq!(harness.store.ready_count(&QueueSelector::all()).await.unwrap(), 1);
    }

    #[rstest]
    #[tokio::test]
    async fn unknown_jobs_are_reported(harness: Harness) {
        let missing = JobId::from_ulid(ulid::Ulid::new());
        assert!(matches!(
            harness.store.job_state(missing).await,
            Err(StoreError::JobNotFound(id)) if id == missing
        ));
        assert!(matches!(harness.store.discard(missing).await, Err(StoreError::JobNotFound(_))));
    }
}
