//! Process registration and heartbeat.
//!
//! The heartbeat runs on its own task so a process busy with slow jobs still
//! reports alive. A heartbeat that finds the row gone (pruned by someone else
//! after a long stall) asks the owning process to stop.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::domain::{NewProcess, ProcessId, ProcessRecord};
use crate::error::StoreError;
use crate::ports::JobStore;

pub struct Registration {
    store: Arc<dyn JobStore>,
    record: ProcessRecord,
    heartbeat: Option<JoinHandle<()>>,
}

impl Registration {
    pub async fn register(
        store: Arc<dyn JobStore>,
        process: NewProcess,
    ) -> Result<Self, StoreError> {
        let record = store.register_process(process).await?;
        info!(
            event = "register_process",
            process_id = %record.id,
            kind = %record.kind,
            hostname = %record.hostname,
            pid = record.pid,
            "registered process"
        );
        Ok(Self {
            store,
            record,
            heartbeat: None,
        })
    }

    pub fn process_id(&self) -> ProcessId {
        self.record.id
    }

    /// Spawns the heartbeat timer. `stop` is flipped to `true` if the process
    /// row disappears.
    pub fn start_heartbeat(&mut self, every: Duration, stop: Arc<watch::Sender<bool>>) {
        self.stop_heartbeat();

        let store = Arc::clone(&self.store);
        let process_id = self.record.id;
        self.heartbeat = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match store.heartbeat(process_id).await {
                    Ok(()) => {}
                    Err(StoreError::ProcessNotFound(_)) => {
                        warn!(process_id = %process_id, "process row is gone; stopping");
                        let _ = stop.send(true);
                        break;
                    }
                    // 接続断などは次の tick で再試行
                    Err(e) => warn!(process_id = %process_id, error = %e, "heartbeat failed"),
                }
            }
        }));
    }

    pub fn stop_heartbeat(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
    }

    /// Deletes the process row. Claims still held are released back to ready.
    pub async fn deregister(mut self) -> Result<usize, StoreError> {
        self.stop_heartbeat();
        let released = self.store.deregister_process(self.record.id).await?;
        info!(
            event = "deregister_process",
            process_id = %self.record.id,
            kind = %self.record.kind,
            released,
            "deregistered process"
        );
        Ok(released)
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.stop_heartbeat();
    }
}
