//! Engine: starts the processes an `EngineConfig` describes.

use std::sync::Arc;

use tracing::{error, info};

use super::dispatcher::Dispatcher;
use super::process::{Process, ProcessHandle};
use super::worker::Worker;
use crate::config::{EngineConfig, Mode};
use crate::domain::{ProcessId, ProcessKind};
use crate::error::SpoolError;
use crate::ports::{JobExecutor, JobStore};

/// # 使用例
/// ```ignore
/// let engine = Engine::new(config, Mode::All, store, Arc::new(registry));
/// let running = engine.start().await?;
/// tokio::signal::ctrl_c().await?;
/// running.stop().await;
/// ```
pub struct Engine {
    config: EngineConfig,
    mode: Mode,
    store: Arc<dyn JobStore>,
    executor: Arc<dyn JobExecutor>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        mode: Mode,
        store: Arc<dyn JobStore>,
        executor: Arc<dyn JobExecutor>,
    ) -> Self {
        Self {
            config,
            mode,
            store,
            executor,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Starts dispatchers, then workers. If any process fails to start, the
    /// ones already running are stopped and the error is returned.
    pub async fn start(&self) -> Result<RunningEngine, SpoolError> {
        self.config.validate()?;
        let mut handles = Vec::new();

        match self.start_all(&mut handles).await {
            Ok(()) => {
                info!(mode = ?self.mode, processes = handles.len(), "engine started");
                Ok(RunningEngine { handles })
            }
            Err(e) => {
                error!(error = %e, "engine failed to start; stopping started processes");
                RunningEngine { handles }.stop().await;
                Err(e)
            }
        }
    }

    async fn start_all(&self, handles: &mut Vec<ProcessHandle>) -> Result<(), SpoolError> {
        if self.mode.runs_dispatchers() {
            for config in &self.config.dispatchers {
                let dispatcher =
                    Dispatcher::new(config.clone(), self.config.registry, Arc::clone(&self.store));
                handles.push(self.process(dispatcher).start().await?);
            }
        }

        if self.mode.runs_workers() {
            for config in &self.config.workers {
                for _ in 0..config.processes {
                    let worker = Worker::new(
                        config.clone(),
                        Arc::clone(&self.store),
                        Arc::clone(&self.executor),
                    );
                    handles.push(self.process(worker).start().await?);
                }
            }
        }
        Ok(())
    }

    fn process<P: super::process::Poll>(&self, poller: P) -> Process<P> {
        Process::new(poller, Arc::clone(&self.store), self.config.registry)
    }
}

pub struct RunningEngine {
    handles: Vec<ProcessHandle>,
}

impl RunningEngine {
    pub fn processes(&self) -> Vec<(ProcessId, ProcessKind)> {
        self.handles
            .iter()
            .map(|h| (h.process_id(), h.kind()))
            .collect()
    }

    /// Stops every process and waits for all of them to drain and deregister.
    pub async fn stop(self) {
        for handle in &self.handles {
            handle.request_stop();
        }
        for handle in self.handles {
            handle.join().await;
        }
        info!("engine stopped");
    }
}
