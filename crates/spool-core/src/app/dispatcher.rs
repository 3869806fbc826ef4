//! Dispatcher: promotes due scheduled executions and runs maintenance.
//!
//! Maintenance (expired-blocked sweep and dead-process pruning) runs on the
//! first poll and then every `concurrency_maintenance_interval`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::process::{Poll, PollOutcome};
use crate::config::{DispatcherConfig, RegistryConfig};
use crate::domain::{ProcessId, ProcessKind, PrunedProcess};
use crate::error::StoreError;
use crate::ports::JobStore;

/// What one maintenance run did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaintenanceReport {
    pub released_blocked: usize,
    pub pruned: Vec<PrunedProcess>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    registry: RegistryConfig,
    store: Arc<dyn JobStore>,
    last_maintenance: Mutex<Option<Instant>>,
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, registry: RegistryConfig, store: Arc<dyn JobStore>) -> Self {
        Self {
            config,
            registry,
            store,
            last_maintenance: Mutex::new(None),
        }
    }

    /// Releases expired blocked executions and prunes dead processes other
    /// than `process_id`. A failure in one step does not skip the other.
    pub async fn run_maintenance(&self, process_id: ProcessId) -> MaintenanceReport {
        let mut report = MaintenanceReport::default();

        match self
            .store
            .release_expired_blocked(self.config.concurrency_maintenance_batch_size)
            .await
        {
            Ok(released) => report.released_blocked = released,
            Err(e) => warn!(process_id = %process_id, error = %e, "blocked sweep failed"),
        }

        match self
            .store
            .prune_dead_processes(self.registry.alive_threshold, Some(process_id))
            .await
        {
            Ok(pruned) => report.pruned = pruned,
            Err(e) => warn!(process_id = %process_id, error = %e, "process pruning failed"),
        }

        report
    }

    async fn maintain_if_due(&self, process_id: ProcessId) {
        let mut last = self.last_maintenance.lock().await;
        let due = last.is_none_or(|at| at.elapsed() >= self.config.concurrency_maintenance_interval);
        if !due {
            return;
        }
        *last = Some(Instant::now());
        drop(last);

        let report = self.run_maintenance(process_id).await;
        debug!(
            process_id = %process_id,
            released_blocked = report.released_blocked,
            pruned = report.pruned.len(),
            "maintenance finished"
        );
    }
}

#[async_trait]
impl Poll for Dispatcher {
    fn kind(&self) -> ProcessKind {
        ProcessKind::Dispatcher
    }

    fn metadata(&self) -> serde_json::Value {
        json!({
            "batch_size": self.config.batch_size,
            "polling_interval": self.config.polling_interval.as_secs_f64(),
            "concurrency_maintenance_interval": self.config.concurrency_maintenance_interval.as_secs_f64(),
        })
    }

    fn polling_interval(&self) -> Duration {
        self.config.polling_interval
    }

    async fn poll(&self, process_id: ProcessId) -> Result<PollOutcome, StoreError> {
        self.maintain_if_due(process_id).await;

        let promoted = self.store.dispatch_scheduled(self.config.batch_size).await?;
        Ok(if promoted >= self.config.batch_size {
            PollOutcome::Busy
        } else {
            PollOutcome::Idle
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::concurrency::{ConcurrencyLimit, StaticConcurrencyPolicy};
    use crate::domain::{JobState, NewJob, NewProcess};
    use crate::ports::{Clock, FixedClock};
    use crate::store::InMemoryJobStore;
    use chrono::{TimeZone, Utc};
    use rstest::{fixture, rstest};

    struct Harness {
        clock: Arc<FixedClock>,
        store: Arc<InMemoryJobStore>,
        dispatcher: Dispatcher,
        process_id: ProcessId,
    }

    #[fixture]
    fn harness() -> Harness {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap()));
        let policy = StaticConcurrencyPolicy::new(ConcurrencyLimit::new(1, Duration::from_secs(60)));
        let store = Arc::new(InMemoryJobStore::with_clock(clock.clone()).with_policy(Arc::new(policy)));
        let dispatcher = Dispatcher::new(
            DispatcherConfig {
                batch_size: 2,
                ..Default::default()
            },
            RegistryConfig::default(),
            store.clone(),
        );
        Harness {
            clock,
            store,
            dispatcher,
            process_id: ProcessId::from_ulid(ulid::Ulid::new()),
        }
    }

    #[rstest]
    #[tokio::test]
    async fn full_batch_polls_again(harness: Harness) {
        let at = harness.clock.now() + chrono::Duration::minutes(1);
        for _ in 0..3 {
            harness
                .store
                .submit(NewJob::new("report", json!(null)).scheduled_at(at))
                .await
                .unwrap();
        }
        harness.clock.advance(Duration::from_secs(120));

        let first = harness.dispatcher.poll(harness.process_id).await.unwrap();
        let second = harness.dispatcher.poll(harness.process_id).await.unwrap();

        assert_eq!(first, PollOutcome::Busy);
        assert_eq!(second, PollOutcome::Idle);
        assert_eq!(harness.store.ready_count(&"*".into()).await.unwrap(), 3);
    }

    #[rstest]
    #[tokio::test]
    async fn maintenance_releases_expired_and_prunes_others(harness: Harness) {
        let store = &harness.store;
        let dead = store
            .register_process(NewProcess::current(ProcessKind::Worker, json!({})))
            .await
            .unwrap();
        let me = store
            .register_process(NewProcess::current(ProcessKind::Dispatcher, json!({})))
            .await
            .unwrap();

        let first = store
            .submit(NewJob::new("sync", json!(null)).with_concurrency_key("account/1"))
            .await
            .unwrap();
        let second = store
            .submit(NewJob::new("sync", json!(null)).with_concurrency_key("account/1"))
            .await
            .unwrap();
        store.claim(&"*".into(), 1, dead.id).await.unwrap();
        assert_eq!(store.job_state(second).await.unwrap(), JobState::Blocked);

        harness.clock.advance(Duration::from_secs(600));
        let report = harness.dispatcher.run_maintenance(me.id).await;

        assert_eq!(report.released_blocked, 1);
        assert_eq!(report.pruned.len(), 1);
        assert_eq!(report.pruned[0].id, dead.id);
        assert_eq!(report.pruned[0].released, 1);
        assert_eq!(store.job_state(first).await.unwrap(), JobState::Ready);
        assert_eq!(store.job_state(second).await.unwrap(), JobState::Ready);
        let remaining: Vec<ProcessId> = store.processes().await.unwrap().iter().map(|p| p.id).collect();
        assert_eq!(remaining, vec![me.id]);
    }

    #[rstest]
    #[tokio::test(start_paused = true)]
    async fn maintenance_runs_once_per_interval(harness: Harness) {
        harness
            .store
            .register_process(NewProcess::current(ProcessKind::Worker, json!({})))
            .await
            .unwrap();
        harness.clock.advance(Duration::from_secs(600));

        harness.dispatcher.poll(harness.process_id).await.unwrap();
        assert!(harness.store.processes().await.unwrap().is_empty());

        let late = harness
            .store
            .register_process(NewProcess::current(ProcessKind::Worker, json!({})))
            .await
            .unwrap();
        harness.clock.advance(Duration::from_secs(600));

        // not due yet: the row survives
        harness.dispatcher.poll(harness.process_id).await.unwrap();
        assert_eq!(harness.store.processes().await.unwrap()[0].id, late.id);

        tokio::time::advance(Duration::from_secs(601)).await;
        harness.dispatcher.poll(harness.process_id).await.unwrap();
        assert!(harness.store.processes().await.unwrap().is_empty());
    }
}
