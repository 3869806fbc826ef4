//! Engine configuration.
//!
//! Plain serde structs; every field has a default so an empty JSON object is a
//! valid configuration. Durations are written as (fractional) seconds.
//!
//! ```json
//! {
//!   "workers": [{ "queues": "critical,mail_*", "threads": 3, "processes": 2 }],
//!   "dispatchers": [{ "batch_size": 100 }],
//!   "concurrency": { "overrides": { "customer": { "to": 2, "duration": 60 } } }
//! }
//! ```

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::concurrency::{ConcurrencyLimit, StaticConcurrencyPolicy};
use crate::domain::QueueSelector;
use crate::error::SpoolError;

/// `serde(with = ...)` adapter for `std::time::Duration` as seconds.
pub mod secs {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(duration.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Which processes an engine starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Work,
    Dispatch,
    #[default]
    All,
}

impl Mode {
    pub fn runs_workers(self) -> bool {
        matches!(self, Mode::Work | Mode::All)
    }

    pub fn runs_dispatchers(self) -> bool {
        matches!(self, Mode::Dispatch | Mode::All)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queues: QueueSelector,
    /// Execution slots per worker process.
    pub threads: usize,
    /// How many identical worker processes to start.
    pub processes: usize,
    #[serde(with = "secs")]
    pub polling_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queues: QueueSelector::all(),
            threads: 5,
            processes: 1,
            polling_interval: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub batch_size: usize,
    #[serde(with = "secs")]
    pub polling_interval: Duration,
    #[serde(with = "secs")]
    pub concurrency_maintenance_interval: Duration,
    pub concurrency_maintenance_batch_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            batch_size: 500,
            polling_interval: Duration::from_secs(1),
            concurrency_maintenance_interval: Duration::from_secs(600),
            concurrency_maintenance_batch_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    #[serde(with = "secs")]
    pub heartbeat_interval: Duration,
    /// A process whose last heartbeat is older than this is dead.
    #[serde(with = "secs")]
    pub alive_threshold: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            alive_threshold: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConcurrencyConfig {
    pub default: ConcurrencyLimit,
    /// Keyed by exact concurrency key or by key group (text before the first `/`).
    pub overrides: HashMap<String, ConcurrencyLimit>,
}

impl ConcurrencyConfig {
    pub fn policy(&self) -> StaticConcurrencyPolicy {
        self.overrides
            .iter()
            .fold(StaticConcurrencyPolicy::new(self.default), |policy, (key, limit)| {
                policy.with_override(key.clone(), *limit)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub workers: Vec<WorkerConfig>,
    pub dispatchers: Vec<DispatcherConfig>,
    pub registry: RegistryConfig,
    pub concurrency: ConcurrencyConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: vec![WorkerConfig::default()],
            dispatchers: vec![DispatcherConfig::default()],
            registry: RegistryConfig::default(),
            concurrency: ConcurrencyConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn from_json(raw: &str) -> Result<Self, SpoolError> {
        let config: Self =
            serde_json::from_str(raw).map_err(|e| SpoolError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SpoolError> {
        if let Some(worker) = self.workers.iter().find(|w| w.threads == 0) {
            return Err(SpoolError::Config(format!(
                "worker for queues {} has zero threads",
                worker.queues
            )));
        }
        if self.dispatchers.iter().any(|d| d.batch_size == 0) {
            return Err(SpoolError::Config("dispatcher batch_size must be positive".into()));
        }
        if self.registry.heartbeat_interval.is_zero() {
            return Err(SpoolError::Config("heartbeat_interval must be positive".into()));
        }
        if self.registry.alive_threshold <= self.registry.heartbeat_interval {
            return Err(SpoolError::Config(
                "alive_threshold must exceed heartbeat_interval".into(),
            ));
        }
        Ok(())
    }

    /// Largest worker pool plus the poll loop and the heartbeat. Sizes the
    /// database connection pool.
    pub fn max_number_of_threads(&self) -> usize {
        self.workers.iter().map(|w| w.threads).max().unwrap_or(0) + 2
    }
}
