//! Tasks and the caller-side handle

use super::messages::PoolCommand;
use crate::error::{AnalysisError, Result};
use crate::types::{AnalysisOptions, AnalysisResult, AudioInput, ProgressCallback, TaskId};
use crossbeam::channel::Sender;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;
use tokio::sync::oneshot;

pub(crate) type TaskReply = oneshot::Sender<Result<AnalysisResult>>;

/// A task waiting in the pending queue
pub(crate) struct QueuedTask {
    pub id: TaskId,
    pub input: AudioInput,
    pub options: AnalysisOptions,
    pub progress: Option<ProgressCallback>,
    pub reply: TaskReply,
    pub submitted_at: Instant,
}

impl QueuedTask {
    /// Resolve the task's future; false if the caller already went away
    pub fn resolve(self, outcome: Result<AnalysisResult>) -> bool {
        self.reply.send(outcome).is_ok()
    }

    /// True once the [`TaskHandle`] has been dropped
    pub fn is_abandoned(&self) -> bool {
        self.reply.is_closed()
    }
}

/// Caller-side handle to a submitted task
///
/// Resolve it with [`wait`](Self::wait) from a plain thread, or `.await`
/// it from async code. Dropping the handle before the task is dispatched
/// means the task is skipped.
pub struct TaskHandle {
    id: TaskId,
    result_rx: oneshot::Receiver<Result<AnalysisResult>>,
    command_tx: Sender<PoolCommand>,
}

impl TaskHandle {
    pub(crate) fn new(
        id: TaskId,
        result_rx: oneshot::Receiver<Result<AnalysisResult>>,
        command_tx: Sender<PoolCommand>,
    ) -> Self {
        Self {
            id,
            result_rx,
            command_tx,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    /// Block until the task resolves
    ///
    /// Must not be called from within an async runtime; `.await` the
    /// handle there instead.
    pub fn wait(self) -> Result<AnalysisResult> {
        self.result_rx.blocking_recv().unwrap_or_else(|_| Err(coordinator_gone()))
    }

    /// Remove the task if it is still queued
    ///
    /// Returns true if it was removed (its result becomes
    /// [`AnalysisError::Cancelled`]). Once dispatched a task runs to
    /// completion or timeout and this is a no-op returning false.
    pub fn cancel(&self) -> bool {
        let (reply, rx) = oneshot::channel();
        if self
            .command_tx
            .send(PoolCommand::Cancel {
                task_id: self.id,
                reply,
            })
            .is_err()
        {
            return false;
        }
        rx.blocking_recv().unwrap_or(false)
    }
}

impl Future for TaskHandle {
    type Output = Result<AnalysisResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.result_rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(coordinator_gone())))
    }
}

fn coordinator_gone() -> AnalysisError {
    AnalysisError::PoolUnavailable("coordinator stopped before the task resolved".to_string())
}
