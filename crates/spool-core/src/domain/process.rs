//! Process registry records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::ProcessId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessKind {
    Dispatcher,
    Worker,
}

impl ProcessKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessKind::Dispatcher => "dispatcher",
            ProcessKind::Worker => "worker",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dispatcher" => Some(ProcessKind::Dispatcher),
            "worker" => Some(ProcessKind::Worker),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProcessKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration request for a starting process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewProcess {
    pub kind: ProcessKind,
    pub hostname: String,
    pub pid: u32,
    /// Lookup only; the supervisor does not own this row.
    pub supervisor_id: Option<ProcessId>,
    pub metadata: serde_json::Value,
}

impl NewProcess {
    /// Registration for the current OS process.
    pub fn current(kind: ProcessKind, metadata: serde_json::Value) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        Self {
            kind,
            hostname,
            pid: std::process::id(),
            supervisor_id: None,
            metadata,
        }
    }

    pub fn supervised_by(mut self, supervisor_id: ProcessId) -> Self {
        self.supervisor_id = Some(supervisor_id);
        self
    }
}

/// A registered, presumed-live process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessRecord {
    pub id: ProcessId,
    pub kind: ProcessKind,
    pub hostname: String,
    pub pid: u32,
    pub supervisor_id: Option<ProcessId>,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
}

impl ProcessRecord {
    pub fn from_new(id: ProcessId, new_process: NewProcess, now: DateTime<Utc>) -> Self {
        Self {
            id,
            kind: new_process.kind,
            hostname: new_process.hostname,
            pid: new_process.pid,
            supervisor_id: new_process.supervisor_id,
            metadata: new_process.metadata,
            created_at: now,
            last_heartbeat_at: now,
        }
    }

    pub fn heartbeat_age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.last_heartbeat_at
    }

    pub fn is_alive(&self, now: DateTime<Utc>, alive_threshold: std::time::Duration) -> bool {
        let threshold = chrono::Duration::from_std(alive_threshold).unwrap_or(chrono::Duration::MAX);
        self.heartbeat_age(now) <= threshold
    }
}

/// Outcome of pruning one dead process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunedProcess {
    pub id: ProcessId,
    pub kind: ProcessKind,
    pub hostname: String,
    pub pid: u32,
    /// Claimed executions moved back to ready.
    pub released: usize,
}
