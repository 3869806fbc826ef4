//! Registry and queue introspection for dashboards and operators.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ProcessId, ProcessKind, ProcessRecord, QueueCounts};
use crate::error::StoreError;
use crate::ports::{Clock, JobStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessStatus {
    pub id: ProcessId,
    pub kind: ProcessKind,
    pub hostname: String,
    pub pid: u32,
    pub metadata: serde_json::Value,
    pub last_heartbeat_at: DateTime<Utc>,
    pub heartbeat_age_secs: i64,
    pub alive: bool,
}

impl ProcessStatus {
    pub fn from_record(record: ProcessRecord, now: DateTime<Utc>, alive_threshold: Duration) -> Self {
        let alive = record.is_alive(now, alive_threshold);
        let heartbeat_age_secs = record.heartbeat_age(now).num_seconds();
        Self {
            id: record.id,
            kind: record.kind,
            hostname: record.hostname,
            pid: record.pid,
            metadata: record.metadata,
            last_heartbeat_at: record.last_heartbeat_at,
            heartbeat_age_secs,
            alive,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub taken_at: DateTime<Utc>,
    pub processes: Vec<ProcessStatus>,
    pub queues: Vec<QueueCounts>,
}

impl Snapshot {
    pub fn live_processes(&self) -> impl Iterator<Item = &ProcessStatus> {
        self.processes.iter().filter(|p| p.alive)
    }

    pub fn pending(&self) -> usize {
        self.queues.iter().map(QueueCounts::pending).sum()
    }
}

pub async fn snapshot(
    store: &dyn JobStore,
    clock: &dyn Clock,
    alive_threshold: Duration,
) -> Result<Snapshot, StoreError> {
    let now = clock.now();
    let processes = store
        .processes()
        .await?
        .into_iter()
        .map(|record| ProcessStatus::from_record(record, now, alive_threshold))
        .collect();
    let queues = store.queue_counts().await?;
    Ok(Snapshot {
        taken_at: now,
        processes,
        queues,
    })
}
