//! Message types for the pool coordinator
//!
//! Commands are request-reply over oneshot channels; [`PoolEvent`]s are an
//! optional broadcast for observers (UI progress, logging, tests).

use super::task::QueuedTask;
use crate::error::AnalysisError;
use crate::types::TaskId;
use std::time::Duration;

/// Commands sent to the coordinator thread
pub(crate) enum PoolCommand {
    /// Queue a task (dispatched immediately if a unit is idle)
    Submit(QueuedTask),

    /// Remove a task that has not been dispatched yet
    Cancel {
        task_id: TaskId,
        reply: tokio::sync::oneshot::Sender<bool>,
    },

    /// Snapshot of the pool state
    Stats {
        reply: tokio::sync::oneshot::Sender<PoolStats>,
    },

    /// Fail outstanding work and stop all units
    Shutdown,
}

/// Pool lifecycle and task events
#[derive(Debug, Clone, PartialEq)]
pub enum PoolEvent {
    /// A unit finished its init handshake
    UnitReady { slot: usize, fallback: bool },
    /// A unit could not be initialized
    UnitInitFailed { slot: usize, error: AnalysisError },
    /// A unit is being replaced after a fault or timeout
    UnitRestarting {
        slot: usize,
        restarts: u32,
        backoff: Duration,
    },
    TaskQueued { task_id: TaskId, queue_depth: usize },
    TaskDispatched { task_id: TaskId, slot: usize },
    TaskCompleted {
        task_id: TaskId,
        slot: usize,
        elapsed: Duration,
    },
    TaskFailed { task_id: TaskId, error: AnalysisError },
    TaskCancelled { task_id: TaskId },
    /// All units stopped; the pool is uninitialized again
    PoolStopped,
}

/// Lifecycle state of one slot as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotStatus {
    Starting,
    Idle,
    Busy,
    Restarting,
}

/// Per-slot detail in [`PoolStats`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    pub index: usize,
    pub status: SlotStatus,
    pub restarts: u32,
    /// Time since the unit last started, finished or reported progress
    pub since_activity: Duration,
}

/// Snapshot of pool state
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub initialized: bool,
    pub target_size: usize,
    pub units: usize,
    pub busy: usize,
    pub idle: usize,
    pub restarting: usize,
    pub queued: usize,
    pub completed: u64,
    pub failed: u64,
    pub restarts: u64,
    pub slots: Vec<SlotInfo>,
}

/// Handle to the coordinator thread
pub(crate) struct ServiceHandle<Cmd> {
    /// Channel for sending commands to the coordinator
    pub command_tx: crossbeam::channel::Sender<Cmd>,
    /// Thread handle for the coordinator
    pub thread_handle: Option<std::thread::JoinHandle<()>>,
}

impl<Cmd> ServiceHandle<Cmd> {
    pub fn send(&self, cmd: Cmd) -> Result<(), crossbeam::channel::SendError<Cmd>> {
        self.command_tx.send(cmd)
    }

    /// Check if the coordinator is still running
    pub fn is_running(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}
