//! Lifecycle - プロセスの状態機械
//!
//! created → starting → running → stopping → stopped
//!
//! 起動・停止はそれぞれ固定順のアクション列を実行する（コールバック登録はしない）。

use std::fmt;

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        matches!(
            (self, next),
            (Created, Starting)
                | (Starting, Running)
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Stopping, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Created => "created",
            LifecycleState::Starting => "starting",
            LifecycleState::Running => "running",
            LifecycleState::Stopping => "stopping",
            LifecycleState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("invalid lifecycle transition: {from} -> {to}")]
    InvalidTransition {
        from: LifecycleState,
        to: LifecycleState,
    },
}

/// Steps run, in this order, while a process is `starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAction {
    Register,
    StartHeartbeat,
    StartPolling,
}

/// Steps run, in this order, while a process is `stopping`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopAction {
    StopPolling,
    DrainPool,
    StopHeartbeat,
    Deregister,
}

pub const START_ACTIONS: [StartAction; 3] = [
    StartAction::Register,
    StartAction::StartHeartbeat,
    StartAction::StartPolling,
];

pub const STOP_ACTIONS: [StopAction; 4] = [
    StopAction::StopPolling,
    StopAction::DrainPool,
    StopAction::StopHeartbeat,
    StopAction::Deregister,
];

/// Shared lifecycle state of one process. Observers `subscribe()` to wait for
/// a state.
#[derive(Debug)]
pub struct Lifecycle {
    state: watch::Sender<LifecycleState>,
}

impl Lifecycle {
    pub fn new() -> Self {
        let (state, _) = watch::channel(LifecycleState::Created);
        Self { state }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn transition(&self, to: LifecycleState) -> Result<(), LifecycleError> {
        let mut from = to;
        let changed = self.state.send_if_modified(|state| {
            from = *state;
            if state.can_transition_to(to) {
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            Ok(())
        } else {
            Err(LifecycleError::InvalidTransition { from, to })
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}
