//! Process - 長寿命のプロセスオブジェクト
//!
//! 登録・heartbeat・ポーリングループ・停止処理を 1 つの状態機械で駆動します。
//! 何を poll するか（worker / dispatcher）は `Poll` trait で差し替えます。
//!
//! # ポーリング
//! - `PollOutcome::Busy`: バッチが埋まった → すぐに再 poll
//! - `PollOutcome::Idle`: 空き・不足 → polling_interval だけ待つ（wake signal で早期復帰）

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::lifecycle::{
    Lifecycle, LifecycleState, START_ACTIONS, STOP_ACTIONS, StartAction, StopAction,
};
use super::registration::Registration;
use crate::config::RegistryConfig;
use crate::domain::{NewProcess, ProcessId, ProcessKind};
use crate::error::{SpoolError, StoreError};
use crate::ports::JobStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// A full batch came back; poll again right away.
    Busy,
    /// Less than a full batch; sleep until the interval or a wake-up.
    Idle,
}

/// The work a process does on every tick.
#[async_trait]
pub trait Poll: Send + Sync + 'static {
    fn kind(&self) -> ProcessKind;

    /// Published on the process row.
    fn metadata(&self) -> serde_json::Value;

    fn polling_interval(&self) -> Duration;

    async fn poll(&self, process_id: ProcessId) -> Result<PollOutcome, StoreError>;

    /// Cuts the sleep between polls short when notified.
    fn wake_signal(&self) -> Option<Arc<Notify>> {
        None
    }

    /// Waits for in-flight work before the process deregisters.
    async fn drain(&self) {}
}

pub struct Process<P: Poll> {
    poller: Arc<P>,
    store: Arc<dyn JobStore>,
    registry: RegistryConfig,
}

impl<P: Poll> Process<P> {
    pub fn new(poller: P, store: Arc<dyn JobStore>, registry: RegistryConfig) -> Self {
        Self {
            poller: Arc::new(poller),
            store,
            registry,
        }
    }

    /// Runs the start actions and spawns the poll loop.
    pub async fn start(self) -> Result<ProcessHandle, SpoolError> {
        let lifecycle = Arc::new(Lifecycle::new());
        lifecycle.transition(LifecycleState::Starting)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let mut registration: Option<Registration> = None;

        for action in START_ACTIONS {
            match action {
                StartAction::Register => {
                    let process = NewProcess::current(self.poller.kind(), self.poller.metadata());
                    match Registration::register(Arc::clone(&self.store), process).await {
                        Ok(r) => registration = Some(r),
                        Err(e) => {
                            lifecycle.transition(LifecycleState::Stopping)?;
                            lifecycle.transition(LifecycleState::Stopped)?;
                            return Err(e.into());
                        }
                    }
                }
                StartAction::StartHeartbeat => {
                    if let Some(r) = registration.as_mut() {
                        r.start_heartbeat(self.registry.heartbeat_interval, Arc::clone(&stop_tx));
                    }
                }
                StartAction::StartPolling => {}
            }
        }

        let Some(registration) = registration else {
            return Err(SpoolError::Config("process started without registration".into()));
        };
        let process_id = registration.process_id();
        let kind = self.poller.kind();

        lifecycle.transition(LifecycleState::Running)?;
        info!(process_id = %process_id, kind = %kind, "process running");

        let join = tokio::spawn(run(
            Arc::clone(&self.poller),
            registration,
            Arc::clone(&lifecycle),
            stop_rx,
        ));

        Ok(ProcessHandle {
            process_id,
            kind,
            lifecycle,
            stop: stop_tx,
            join,
        })
    }
}

async fn run<P: Poll>(
    poller: Arc<P>,
    registration: Registration,
    lifecycle: Arc<Lifecycle>,
    mut stop: watch::Receiver<bool>,
) {
    let process_id = registration.process_id();
    let wake = poller.wake_signal();
    let interval = poller.polling_interval();

    while !*stop.borrow() {
        let outcome = match poller.poll(process_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(process_id = %process_id, error = %e, "poll failed; retrying next tick");
                PollOutcome::Idle
            }
        };

        if outcome == PollOutcome::Busy {
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = stop.changed() => {}
            _ = tokio::time::sleep(interval) => {}
            _ = notified(wake.as_deref()) => {}
        }
    }

    if let Err(e) = lifecycle.transition(LifecycleState::Stopping) {
        warn!(process_id = %process_id, error = %e, "unexpected lifecycle state");
    }

    let mut registration = Some(registration);
    for action in STOP_ACTIONS {
        debug!(process_id = %process_id, action = ?action, "stop action");
        match action {
            StopAction::StopPolling => {}
            StopAction::DrainPool => poller.drain().await,
            StopAction::StopHeartbeat => {
                if let Some(r) = registration.as_mut() {
                    r.stop_heartbeat();
                }
            }
            StopAction::Deregister => {
                let Some(r) = registration.take() else {
                    continue;
                };
                if let Err(e) = r.deregister().await {
                    error!(process_id = %process_id, error = %e, "deregistration failed");
                }
            }
        }
    }

    if let Err(e) = lifecycle.transition(LifecycleState::Stopped) {
        warn!(process_id = %process_id, error = %e, "unexpected lifecycle state");
    }
    info!(process_id = %process_id, "process stopped");
}

async fn notified(signal: Option<&Notify>) {
    match signal {
        Some(signal) => signal.notified().await,
        None => std::future::pending().await,
    }
}

/// Handle to a running process.
pub struct ProcessHandle {
    process_id: ProcessId,
    kind: ProcessKind,
    lifecycle: Arc<Lifecycle>,
    stop: Arc<watch::Sender<bool>>,
    join: JoinHandle<()>,
}

impl ProcessHandle {
    pub fn process_id(&self) -> ProcessId {
        self.process_id
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Stops taking new work. In-flight jobs still run to completion.
    pub fn request_stop(&self) {
        // receivers may already be dropped
        let _ = self.stop.send(true);
    }

    /// Requests a stop and waits for drain and deregistration.
    pub async fn stop(self) {
        self.request_stop();
        self.join().await;
    }

    /// Waits for the process to stop on its own (self-stop, or a stop requested
    /// elsewhere).
    pub async fn join(self) {
        if let Err(e) = self.join.await {
            error!(process_id = %self.process_id, error = %e, "process task aborted");
        }
    }
}
