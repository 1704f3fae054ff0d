//! Coordinator thread
//!
//! Owns every slot, the pending queue and all dispatch decisions. Commands
//! from the pool handle and events from units are serialized through one
//! `select!` loop, so no pool state is shared between threads.
//!
//! While any slot has a deadline (task timeout, init timeout, restart
//! backoff) the loop wakes for the nearest one, or every [`TICK`] at the
//! latest. An idle pool with nothing pending sleeps until a message arrives.

use super::messages::{PoolCommand, PoolEvent, PoolStats, SlotInfo, SlotStatus};
use super::task::{QueuedTask, TaskReply};
use super::unit::{spawn_unit, UnitCommand, UnitEvent, UnitEventKind, UnitHandle};
use crate::analysis::AnalyzerFactory;
use crate::cache::validate_result;
use crate::config::PoolConfig;
use crate::error::{AnalysisError, Result};
use crate::types::{AnalysisResult, ProgressCallback, TaskId};
use crossbeam::channel::{Receiver, Sender};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Longest the loop sleeps while a deadline is pending
const TICK: Duration = Duration::from_millis(100);

/// The task a busy slot is running
struct InFlight {
    id: TaskId,
    progress: Option<ProgressCallback>,
    reply: TaskReply,
    dispatched_at: Instant,
}

enum SlotState {
    /// Waiting for the init handshake
    Starting { deadline: Instant, restart: bool },
    Ready,
    Busy { task: InFlight, deadline: Instant },
    /// Old unit retired, replacement spawns at `until`
    Backoff { until: Instant },
}

struct Slot {
    index: usize,
    generation: u64,
    unit: Option<UnitHandle>,
    state: SlotState,
    /// Only grows
    restarts: u32,
    last_activity: Instant,
}

impl Slot {
    fn deadline(&self) -> Option<Instant> {
        match &self.state {
            SlotState::Starting { deadline, .. } | SlotState::Busy { deadline, .. } => Some(*deadline),
            SlotState::Backoff { until } => Some(*until),
            SlotState::Ready => None,
        }
    }

    fn status(&self) -> SlotStatus {
        match &self.state {
            SlotState::Starting { restart: false, .. } => SlotStatus::Starting,
            SlotState::Starting { restart: true, .. } | SlotState::Backoff { .. } => SlotStatus::Restarting,
            SlotState::Ready => SlotStatus::Idle,
            SlotState::Busy { .. } => SlotStatus::Busy,
        }
    }

    fn in_flight(&self) -> Option<TaskId> {
        match &self.state {
            SlotState::Busy { task, .. } => Some(task.id),
            _ => None,
        }
    }

    /// Take the in-flight task, leaving the slot ready
    fn take_task(&mut self) -> Option<InFlight> {
        match std::mem::replace(&mut self.state, SlotState::Ready) {
            SlotState::Busy { task, .. } => Some(task),
            other => {
                self.state = other;
                None
            }
        }
    }

    /// Stop the current unit and invalidate anything it still sends
    fn retire_unit(&mut self) {
        self.generation += 1;
        if let Some(unit) = self.unit.take() {
            unit.detach();
        }
    }
}

pub(crate) struct CoordinatorSetup {
    pub config: PoolConfig,
    pub target_size: usize,
    pub factory: Arc<dyn AnalyzerFactory>,
    pub events: Option<Sender<PoolEvent>>,
}

pub(crate) struct Coordinator {
    config: PoolConfig,
    target_size: usize,
    factory: Arc<dyn AnalyzerFactory>,
    events: Option<Sender<PoolEvent>>,
    command_rx: Receiver<PoolCommand>,
    unit_tx: Sender<UnitEvent>,
    unit_rx: Receiver<UnitEvent>,
    slots: Vec<Slot>,
    queue: VecDeque<QueuedTask>,
    /// Answered once every slot has finished its first handshake
    startup: Option<oneshot::Sender<Result<usize>>>,
    completed: u64,
    failed: u64,
    restarts: u64,
    stopped: bool,
}

impl Coordinator {
    pub fn new(
        setup: CoordinatorSetup,
        command_rx: Receiver<PoolCommand>,
        startup: oneshot::Sender<Result<usize>>,
    ) -> Self {
        let (unit_tx, unit_rx) = crossbeam::channel::unbounded();
        Self {
            config: setup.config,
            target_size: setup.target_size,
            factory: setup.factory,
            events: setup.events,
            command_rx,
            unit_tx,
            unit_rx,
            slots: Vec::with_capacity(setup.target_size),
            queue: VecDeque::new(),
            startup: Some(startup),
            completed: 0,
            failed: 0,
            restarts: 0,
            stopped: false,
        }
    }

    /// Main coordinator loop
    pub fn run(mut self) {
        log::info!("Analysis pool starting {} execution units", self.target_size);

        let command_rx = self.command_rx.clone();
        let unit_rx = self.unit_rx.clone();

        self.start_units();
        self.finish_startup();

        while !self.stopped {
            let wakeup = match self.next_wakeup(Instant::now()) {
                Some(timeout) => crossbeam::channel::after(timeout),
                None => crossbeam::channel::never(),
            };

            crossbeam::select! {
                recv(command_rx) -> msg => match msg {
                    Ok(cmd) => self.handle_command(cmd),
                    Err(_) => {
                        log::info!("Analysis pool handle dropped, shutting down");
                        self.shutdown();
                    }
                },
                recv(unit_rx) -> msg => {
                    if let Ok(event) = msg {
                        self.handle_unit_event(event);
                    }
                }
                recv(wakeup) -> _ => {}
            }

            if self.stopped {
                break;
            }

            self.check_deadlines(Instant::now());
            self.finish_startup();
            self.dispatch_pending();
        }

        log::info!("Analysis pool coordinator stopped");
    }

    fn emit(&self, event: PoolEvent) {
        if let Some(tx) = &self.events {
            // Never block on a slow observer
            let _ = tx.try_send(event);
        }
    }

    fn position(&self, index: usize) -> Option<usize> {
        self.slots.iter().position(|s| s.index == index)
    }

    /// Time until the nearest slot deadline; `None` when nothing is pending
    fn next_wakeup(&self, now: Instant) -> Option<Duration> {
        self.slots
            .iter()
            .filter_map(Slot::deadline)
            .map(|deadline| deadline.saturating_duration_since(now))
            .min()
            .map(|d| d.min(TICK))
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    fn start_units(&mut self) {
        for index in 0..self.target_size {
            let now = Instant::now();
            match spawn_unit(index, 0, Arc::clone(&self.factory), self.unit_tx.clone()) {
                Ok(unit) => {
                    unit.send(UnitCommand::Init);
                    self.slots.push(Slot {
                        index,
                        generation: 0,
                        unit: Some(unit),
                        state: SlotState::Starting {
                            deadline: now + self.config.init_timeout(),
                            restart: false,
                        },
                        restarts: 0,
                        last_activity: now,
                    });
                }
                Err(e) => {
                    log::warn!("Failed to spawn execution unit {}: {}", index, e);
                    self.emit(PoolEvent::UnitInitFailed {
                        slot: index,
                        error: AnalysisError::PoolUnavailable(e.to_string()),
                    });
                }
            }
        }
    }

    fn finish_startup(&mut self) {
        if self.startup.is_none()
            || self
                .slots
                .iter()
                .any(|s| matches!(s.state, SlotState::Starting { restart: false, .. }))
        {
            return;
        }
        let Some(startup) = self.startup.take() else {
            return;
        };

        let ready = self.slots.len();
        if ready == 0 {
            log::error!("Analysis pool failed to start: no execution unit initialized");
            self.stopped = true;
            let _ = startup.send(Err(AnalysisError::NoUnitsAvailable));
            return;
        }

        if ready < self.target_size {
            log::warn!(
                "Analysis pool running degraded: {}/{} units initialized",
                ready,
                self.target_size
            );
        } else {
            log::info!("Analysis pool ready with {} units", ready);
        }
        let _ = startup.send(Ok(ready));
    }

    fn shutdown(&mut self) {
        log::info!(
            "Shutting down analysis pool ({} units, {} queued)",
            self.slots.len(),
            self.queue.len()
        );
        self.stopped = true;

        for pos in 0..self.slots.len() {
            if let Some(task) = self.slots[pos].take_task() {
                self.fail_task(task, AnalysisError::PoolShuttingDown);
            }
        }
        while let Some(task) = self.queue.pop_front() {
            let task_id = task.id;
            self.failed += 1;
            self.emit(PoolEvent::TaskFailed {
                task_id,
                error: AnalysisError::PoolShuttingDown,
            });
            task.resolve(Err(AnalysisError::PoolShuttingDown));
        }

        let mut units = Vec::new();
        for slot in &mut self.slots {
            if let Some(unit) = slot.unit.take() {
                unit.send(UnitCommand::Terminate);
                units.push((slot.index, slot.generation, unit));
            }
        }

        let grace = self.config.shutdown_grace();
        let deadline = Instant::now() + grace;
        let mut waiting: Vec<(usize, u64)> = units.iter().map(|(i, g, _)| (*i, *g)).collect();
        while !waiting.is_empty() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.unit_rx.recv_timeout(remaining) {
                Ok(UnitEvent {
                    slot,
                    generation,
                    kind: UnitEventKind::Exited,
                }) => waiting.retain(|&entry| entry != (slot, generation)),
                Ok(_) => {}
                Err(_) => break,
            }
        }

        for (index, generation, unit) in units {
            if waiting.contains(&(index, generation)) {
                log::warn!("Unit {} did not stop within {:?}, detaching it", index, grace);
                unit.detach();
            } else {
                unit.join();
            }
        }

        self.slots.clear();
        self.emit(PoolEvent::PoolStopped);
    }

    // ------------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------------

    fn handle_command(&mut self, cmd: PoolCommand) {
        match cmd {
            PoolCommand::Submit(task) => {
                let task_id = task.id;
                log::debug!("Queued {} ('{}')", task_id, task.input.name);
                self.queue.push_back(task);
                self.emit(PoolEvent::TaskQueued {
                    task_id,
                    queue_depth: self.queue.len(),
                });
                self.dispatch_pending();
            }

            PoolCommand::Cancel { task_id, reply } => {
                let removed = match self.queue.iter().position(|t| t.id == task_id) {
                    Some(pos) => {
                        if let Some(task) = self.queue.remove(pos) {
                            log::debug!("Cancelled {} before dispatch", task_id);
                            task.resolve(Err(AnalysisError::Cancelled));
                            self.emit(PoolEvent::TaskCancelled { task_id });
                        }
                        true
                    }
                    None => false,
                };
                let _ = reply.send(removed);
            }

            PoolCommand::Stats { reply } => {
                let _ = reply.send(self.stats());
            }

            PoolCommand::Shutdown => self.shutdown(),
        }
    }

    fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let count = |status: SlotStatus| self.slots.iter().filter(|s| s.status() == status).count();

        PoolStats {
            initialized: true,
            target_size: self.target_size,
            units: self.slots.len(),
            busy: count(SlotStatus::Busy),
            idle: count(SlotStatus::Idle),
            restarting: count(SlotStatus::Restarting),
            queued: self.queue.len(),
            completed: self.completed,
            failed: self.failed,
            restarts: self.restarts,
            slots: self
                .slots
                .iter()
                .map(|s| SlotInfo {
                    index: s.index,
                    status: s.status(),
                    restarts: s.restarts,
                    since_activity: now.saturating_duration_since(s.last_activity),
                })
                .collect(),
        }
    }

    // ------------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------------

    /// Hand queued tasks to idle units, oldest first
    fn dispatch_pending(&mut self) {
        while let Some(pos) = self.slots.iter().position(|s| matches!(s.state, SlotState::Ready)) {
            let Some(task) = self.next_live_task() else {
                break;
            };
            self.dispatch(pos, task);
        }
    }

    fn next_live_task(&mut self) -> Option<QueuedTask> {
        while let Some(task) = self.queue.pop_front() {
            if task.is_abandoned() {
                log::debug!("Skipping {}: handle dropped before dispatch", task.id);
                continue;
            }
            return Some(task);
        }
        None
    }

    fn dispatch(&mut self, pos: usize, task: QueuedTask) {
        let now = Instant::now();
        let slot = &mut self.slots[pos];
        let index = slot.index;

        let sent = slot.unit.as_ref().is_some_and(|unit| {
            unit.send(UnitCommand::Analyze {
                task_id: task.id,
                input: task.input.clone(),
                options: task.options,
            })
        });
        if !sent {
            log::warn!("Unit {} unreachable, requeueing {}", index, task.id);
            self.queue.push_front(task);
            self.unit_fault(pos, "command channel closed".to_string());
            return;
        }

        log::debug!(
            "Dispatching {} ('{}') to unit {} after {:?} in queue",
            task.id,
            task.input.name,
            index,
            task.submitted_at.elapsed()
        );

        let task_id = task.id;
        slot.last_activity = now;
        slot.state = SlotState::Busy {
            task: InFlight {
                id: task.id,
                progress: task.progress,
                reply: task.reply,
                dispatched_at: now,
            },
            deadline: now + self.config.task_timeout(),
        };
        self.emit(PoolEvent::TaskDispatched { task_id, slot: index });
    }

    fn fail_task(&mut self, task: InFlight, error: AnalysisError) {
        self.failed += 1;
        log::info!("{} failed: {}", task.id, error);
        self.emit(PoolEvent::TaskFailed {
            task_id: task.id,
            error: error.clone(),
        });
        let _ = task.reply.send(Err(error));
    }

    // ------------------------------------------------------------------------
    // Unit events
    // ------------------------------------------------------------------------

    fn handle_unit_event(&mut self, event: UnitEvent) {
        let Some(pos) = self.position(event.slot) else {
            log::debug!("Discarding event from removed slot {}", event.slot);
            return;
        };
        if self.slots[pos].generation != event.generation {
            log::debug!(
                "Discarding stale event from unit {} (gen {}, current {})",
                event.slot,
                event.generation,
                self.slots[pos].generation
            );
            return;
        }

        let now = Instant::now();
        match event.kind {
            UnitEventKind::Ready { fallback } => {
                let slot = &mut self.slots[pos];
                if !matches!(slot.state, SlotState::Starting { .. }) {
                    return;
                }
                slot.state = SlotState::Ready;
                slot.last_activity = now;
                let index = slot.index;
                match &fallback {
                    Some(reason) => log::warn!("Unit {} ready with fallback analyzer ({})", index, reason),
                    None => log::debug!("Unit {} ready", index),
                }
                self.emit(PoolEvent::UnitReady {
                    slot: index,
                    fallback: fallback.is_some(),
                });
            }

            UnitEventKind::InitFailed(reason) => {
                self.init_failed(pos, AnalysisError::Analyzer(reason));
            }

            UnitEventKind::Progress { task_id, progress } => {
                let slot = &mut self.slots[pos];
                if let SlotState::Busy { task, .. } = &slot.state {
                    if task.id == task_id {
                        if let Some(callback) = &task.progress {
                            callback(progress);
                        }
                        slot.last_activity = now;
                    }
                }
            }

            UnitEventKind::Result { task_id, result } => self.finish_task(pos, task_id, Ok(result)),

            UnitEventKind::Error { task_id, message } => {
                self.finish_task(pos, task_id, Err(AnalysisError::Analyzer(message)))
            }

            UnitEventKind::Fault(message) => self.unit_fault(pos, message),

            UnitEventKind::Exited => match self.slots[pos].state {
                SlotState::Starting { .. } => self.init_failed(
                    pos,
                    AnalysisError::PoolUnavailable("unit exited during initialization".to_string()),
                ),
                SlotState::Ready | SlotState::Busy { .. } => {
                    self.unit_fault(pos, "execution unit exited unexpectedly".to_string())
                }
                SlotState::Backoff { .. } => {}
            },
        }
    }

    fn finish_task(&mut self, pos: usize, task_id: TaskId, outcome: Result<AnalysisResult>) {
        let slot = &mut self.slots[pos];
        if slot.in_flight() != Some(task_id) {
            log::debug!("Ignoring outcome for {}: not in flight on unit {}", task_id, slot.index);
            return;
        }
        let Some(task) = slot.take_task() else {
            return;
        };
        slot.last_activity = Instant::now();
        let index = slot.index;

        let outcome = outcome.and_then(|result| match validate_result(&result) {
            Ok(()) => Ok(result),
            Err(reason) => Err(AnalysisError::InvalidResult(reason)),
        });

        match outcome {
            Ok(result) => {
                let elapsed = task.dispatched_at.elapsed();
                self.completed += 1;
                log::debug!("{} completed on unit {} in {:?}", task_id, index, elapsed);
                self.emit(PoolEvent::TaskCompleted {
                    task_id,
                    slot: index,
                    elapsed,
                });
                if task.reply.send(Ok(result)).is_err() {
                    log::debug!("{} finished after its handle was dropped", task_id);
                }
            }
            Err(error) => self.fail_task(task, error),
        }
    }

    fn unit_fault(&mut self, pos: usize, message: String) {
        let index = self.slots[pos].index;
        log::warn!("Unit {} faulted: {}", index, message);
        if let Some(task) = self.slots[pos].take_task() {
            self.fail_task(task, AnalysisError::UnitFault { slot: index, message });
        }
        self.restart_slot(pos, Instant::now());
    }

    fn init_failed(&mut self, pos: usize, error: AnalysisError) {
        let restart = match &self.slots[pos].state {
            SlotState::Starting { restart, .. } => *restart,
            _ => return,
        };
        let index = self.slots[pos].index;
        self.emit(PoolEvent::UnitInitFailed {
            slot: index,
            error: error.clone(),
        });

        if restart {
            log::warn!("Unit {} failed to re-initialize: {}", index, error);
            self.restart_slot(pos, Instant::now());
        } else {
            log::warn!("Unit {} failed to initialize, dropping slot: {}", index, error);
            let mut slot = self.slots.remove(pos);
            slot.retire_unit();
        }
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    fn check_deadlines(&mut self, now: Instant) {
        // Reverse order: a failed first handshake removes its slot
        for pos in (0..self.slots.len()).rev() {
            match self.slots[pos].deadline() {
                Some(deadline) if deadline <= now => {}
                _ => continue,
            }

            match self.slots[pos].state {
                SlotState::Starting { .. } => {
                    let error = AnalysisError::InitializationTimeout {
                        slot: self.slots[pos].index,
                        timeout: self.config.init_timeout(),
                    };
                    self.init_failed(pos, error);
                }
                SlotState::Busy { .. } => {
                    let timeout = self.config.task_timeout();
                    let index = self.slots[pos].index;
                    if let Some(task) = self.slots[pos].take_task() {
                        log::warn!("{} timed out after {:?} on unit {}", task.id, timeout, index);
                        self.fail_task(task, AnalysisError::TaskTimeout(timeout));
                    }
                    self.restart_slot(pos, now);
                }
                SlotState::Backoff { .. } => self.respawn(pos, now),
                SlotState::Ready => {}
            }
        }
    }

    /// Retire the slot's unit and schedule a replacement after backoff
    fn restart_slot(&mut self, pos: usize, now: Instant) {
        let slot = &mut self.slots[pos];
        slot.retire_unit();
        slot.restarts += 1;
        let restarts = slot.restarts;
        let index = slot.index;
        let backoff = self.config.restart_backoff(restarts);
        slot.state = SlotState::Backoff { until: now + backoff };
        self.restarts += 1;

        if restarts > self.config.max_restarts {
            log::error!(
                "Unit {} is flapping: restart #{} exceeds limit of {}, retrying in {:?}",
                index,
                restarts,
                self.config.max_restarts,
                backoff
            );
        } else {
            log::warn!("Restarting unit {} in {:?} (restart #{})", index, backoff, restarts);
        }

        self.emit(PoolEvent::UnitRestarting {
            slot: index,
            restarts,
            backoff,
        });
    }

    fn respawn(&mut self, pos: usize, now: Instant) {
        let (index, generation) = (self.slots[pos].index, self.slots[pos].generation);
        match spawn_unit(index, generation, Arc::clone(&self.factory), self.unit_tx.clone()) {
            Ok(unit) => {
                unit.send(UnitCommand::Init);
                let slot = &mut self.slots[pos];
                slot.unit = Some(unit);
                slot.state = SlotState::Starting {
                    deadline: now + self.config.init_timeout(),
                    restart: true,
                };
                slot.last_activity = now;
                log::debug!("Unit {} respawned (gen {})", index, generation);
            }
            Err(e) => {
                log::error!("Failed to respawn unit {}: {}", index, e);
                self.restart_slot(pos, now);
            }
        }
    }
}
