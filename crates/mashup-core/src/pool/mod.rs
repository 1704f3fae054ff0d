//! Adaptive analysis worker pool
//!
//! A fixed number of execution units (sized from the host environment)
//! run analysis tasks in parallel. Submissions beyond that capacity wait
//! in a FIFO queue and are dispatched as soon as a unit frees up.
//!
//! ## Architecture
//!
//! ```text
//! AnalysisPool ──PoolCommand──▶ coordinator thread ──UnitCommand──▶ unit threads
//!      ▲                              │  ▲                               │
//!      └──── TaskHandle (oneshot) ◀───┘  └────────── UnitEvent ─────────┘
//! ```
//!
//! The coordinator owns all pool state. Hung tasks are failed after the
//! task timeout and their unit is replaced; crashed units are replaced
//! with exponential backoff. Replaced units are tagged with a new
//! generation so anything the old unit still sends is discarded.
//!
//! The pool initializes lazily on first submit and can be terminated and
//! re-initialized any number of times.
//!
//! ## Parallelism
//!
//! Each slot runs at most one task, so the pool never dispatches more than
//! its target size at once. A unit replaced after a task timeout cannot be
//! killed, though: it is detached and may keep computing until its
//! analyzer returns, alongside the replacement. Its result is discarded,
//! but for that window actual CPU use can exceed the target size.

mod coordinator;
mod messages;
pub mod sizing;
mod task;
mod unit;

pub use messages::{PoolEvent, PoolStats, SlotInfo, SlotStatus};
pub use sizing::{CapacityPolicy, EnvironmentSignals, FixedCapacity, HostProfile, HostProfilePolicy};
pub use task::TaskHandle;

use crate::analysis::AnalyzerFactory;
use crate::config::PoolConfig;
use crate::error::{AnalysisError, Result};
use crate::types::{AnalysisOptions, AudioInput, ProgressCallback, TaskId};
use coordinator::{Coordinator, CoordinatorSetup};
use crossbeam::channel::Sender;
use messages::{PoolCommand, ServiceHandle};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Instant;
use task::QueuedTask;
use tokio::sync::oneshot;

/// Bounded, fault-tolerant pool of analysis execution units
///
/// Share it with `Arc`; all methods take `&self`. The blocking methods
/// (`initialize`, `submit`, `stats`, `terminate`) must not be called from
/// inside an async runtime.
pub struct AnalysisPool {
    config: PoolConfig,
    factory: Arc<dyn AnalyzerFactory>,
    policy: Box<dyn CapacityPolicy>,
    environment: EnvironmentSignals,
    events: Option<Sender<PoolEvent>>,
    service: Mutex<Option<ServiceHandle<PoolCommand>>>,
    next_task_id: AtomicU64,
}

impl AnalysisPool {
    /// Create an uninitialized pool
    ///
    /// No threads are started until the first `submit` or `initialize`.
    pub fn new(mut config: PoolConfig, factory: impl AnalyzerFactory) -> Self {
        config.validate();
        Self {
            config,
            factory: Arc::new(factory),
            policy: Box::new(HostProfilePolicy),
            environment: EnvironmentSignals::detect(),
            events: None,
            service: Mutex::new(None),
            next_task_id: AtomicU64::new(0),
        }
    }

    /// Replace the sizing policy
    pub fn with_capacity_policy(mut self, policy: impl CapacityPolicy + 'static) -> Self {
        self.policy = Box::new(policy);
        self
    }

    /// Use fixed environment signals instead of the detected ones
    pub fn with_environment(mut self, environment: EnvironmentSignals) -> Self {
        self.environment = environment;
        self
    }

    /// Broadcast [`PoolEvent`]s to this channel (sent with `try_send`)
    pub fn with_events(mut self, events: Sender<PoolEvent>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of units the next initialization will start
    ///
    /// Whatever the policy answers is clamped to
    /// `1..=min(max_workers, available_parallelism)`.
    pub fn target_size(&self) -> usize {
        let ceiling = self.config.max_workers.min(self.environment.available_parallelism).max(1);
        self.policy.target_size(&self.config, &self.environment).clamp(1, ceiling)
    }

    fn lock_service(&self) -> MutexGuard<'_, Option<ServiceHandle<PoolCommand>>> {
        self.service.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the units now instead of on first submit
    ///
    /// Idempotent. Units that fail their init handshake are dropped and
    /// the pool runs with reduced capacity; only if none initialize does
    /// this fail with [`AnalysisError::NoUnitsAvailable`].
    pub fn initialize(&self) -> Result<()> {
        let mut service = self.lock_service();
        self.ensure_running(&mut service)
    }

    pub fn is_initialized(&self) -> bool {
        self.lock_service().as_ref().is_some_and(|handle| handle.is_running())
    }

    fn ensure_running(&self, service: &mut Option<ServiceHandle<PoolCommand>>) -> Result<()> {
        if let Some(handle) = service.as_ref() {
            if handle.is_running() {
                return Ok(());
            }
            log::warn!("Analysis pool coordinator exited unexpectedly, reinitializing");
        }
        *service = None;

        let target_size = self.target_size();
        let (command_tx, command_rx) = crossbeam::channel::unbounded();
        let (startup_tx, startup_rx) = oneshot::channel();

        let coordinator = Coordinator::new(
            CoordinatorSetup {
                config: self.config.clone(),
                target_size,
                factory: Arc::clone(&self.factory),
                events: self.events.clone(),
            },
            command_rx,
            startup_tx,
        );

        let thread_handle = thread::Builder::new()
            .name("analysis-pool".into())
            .spawn(move || coordinator.run())
            .map_err(|e| AnalysisError::PoolUnavailable(format!("Failed to spawn coordinator thread: {}", e)))?;

        match startup_rx.blocking_recv() {
            Ok(Ok(units)) => {
                log::info!("Analysis pool initialized with {}/{} units", units, target_size);
                *service = Some(ServiceHandle {
                    command_tx,
                    thread_handle: Some(thread_handle),
                });
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = thread_handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = thread_handle.join();
                Err(AnalysisError::PoolUnavailable(
                    "coordinator exited during startup".to_string(),
                ))
            }
        }
    }

    /// Submit a task, initializing the pool if needed
    ///
    /// The task runs as soon as a unit is idle; until then it waits in
    /// submission order. `progress` is called on the coordinator thread
    /// and should return quickly.
    pub fn submit(
        &self,
        input: AudioInput,
        options: AnalysisOptions,
        progress: Option<ProgressCallback>,
    ) -> Result<TaskHandle> {
        let mut service = self.lock_service();
        self.ensure_running(&mut service)?;
        let Some(handle) = service.as_ref() else {
            return Err(AnalysisError::PoolUnavailable("pool is not running".to_string()));
        };

        let id = TaskId(self.next_task_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (reply, result_rx) = oneshot::channel();

        handle
            .send(PoolCommand::Submit(QueuedTask {
                id,
                input,
                options,
                progress,
                reply,
                submitted_at: Instant::now(),
            }))
            .map_err(|_| AnalysisError::PoolUnavailable("coordinator stopped".to_string()))?;

        Ok(TaskHandle::new(id, result_rx, handle.command_tx.clone()))
    }

    /// Current pool state; an uninitialized pool reports only its target size
    pub fn stats(&self) -> PoolStats {
        let idle = PoolStats {
            target_size: self.target_size(),
            ..PoolStats::default()
        };

        let (reply, rx) = oneshot::channel();
        {
            let service = self.lock_service();
            let Some(handle) = service.as_ref() else {
                return idle;
            };
            if handle.send(PoolCommand::Stats { reply }).is_err() {
                return idle;
            }
        }
        rx.blocking_recv().unwrap_or(idle)
    }

    /// Stop all units and fail outstanding tasks with
    /// [`AnalysisError::PoolShuttingDown`]
    ///
    /// Units get the configured grace period to exit; any still running
    /// after that are detached. The next `submit` re-initializes.
    pub fn terminate(&self) {
        let Some(mut handle) = self.lock_service().take() else {
            return;
        };

        log::info!("Terminating analysis pool");
        let _ = handle.send(PoolCommand::Shutdown);
        if let Some(thread_handle) = handle.thread_handle.take() {
            if thread_handle.join().is_err() {
                log::error!("Analysis pool coordinator panicked");
            }
        }
    }
}

impl Drop for AnalysisPool {
    fn drop(&mut self) {
        self.terminate();
    }
}
