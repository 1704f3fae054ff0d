//! Execution units
//!
//! Each unit is a dedicated thread owning one [`Analyzer`]. The coordinator
//! talks to it only through channels:
//!
//! ```text
//! coordinator ──Init──────────────▶ unit ──Ready / InitFailed──▶ coordinator
//! coordinator ──Analyze{task}─────▶ unit ──Progress*───────────▶ coordinator
//!                                        ──Result / Error──────▶
//! coordinator ──Terminate─────────▶ unit ──Exited──────────────▶
//! ```
//!
//! A panic inside the analyzer is caught and reported as `Fault`, after
//! which the thread exits. Every event is tagged with the unit's slot and
//! generation so the coordinator can drop messages from a unit it already
//! replaced.

use crate::analysis::{Analyzer, AnalyzerFactory};
use crate::types::{AnalysisOptions, AnalysisResult, AudioInput, Progress, TaskId};
use crossbeam::channel::{Receiver, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Commands sent from the coordinator to a unit
pub(crate) enum UnitCommand {
    /// Build the analyzer and report readiness
    Init,
    /// Run one task
    Analyze {
        task_id: TaskId,
        input: AudioInput,
        options: AnalysisOptions,
    },
    /// Finish and exit
    Terminate,
}

/// What a unit reports
#[derive(Debug)]
pub(crate) enum UnitEventKind {
    /// Analyzer built; `fallback` carries the primary's error if a fallback is in use
    Ready { fallback: Option<String> },
    InitFailed(String),
    Progress { task_id: TaskId, progress: Progress },
    Result { task_id: TaskId, result: AnalysisResult },
    Error { task_id: TaskId, message: String },
    /// The analyzer panicked; the thread is exiting
    Fault(String),
    /// The thread is gone (sent on every exit path)
    Exited,
}

#[derive(Debug)]
pub(crate) struct UnitEvent {
    pub slot: usize,
    pub generation: u64,
    pub kind: UnitEventKind,
}

/// Coordinator-side handle to a unit thread
pub(crate) struct UnitHandle {
    command_tx: Sender<UnitCommand>,
    thread_handle: Option<JoinHandle<()>>,
}

impl UnitHandle {
    /// Send a command, returning false if the unit is gone
    pub fn send(&self, cmd: UnitCommand) -> bool {
        self.command_tx.send(cmd).is_ok()
    }

    /// Ask the unit to stop and let it go without waiting
    ///
    /// A unit stuck inside an analyzer cannot be interrupted. It keeps
    /// running until the analyzer returns, then sees `Terminate` and exits.
    pub fn detach(mut self) {
        let _ = self.command_tx.send(UnitCommand::Terminate);
        self.thread_handle.take();
    }

    /// Wait for a unit that has already reported `Exited`
    pub fn join(mut self) {
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Sends `Exited` when the unit thread unwinds or returns
struct ExitNotice {
    event_tx: Sender<UnitEvent>,
    slot: usize,
    generation: u64,
}

impl Drop for ExitNotice {
    fn drop(&mut self) {
        let _ = self.event_tx.send(UnitEvent {
            slot: self.slot,
            generation: self.generation,
            kind: UnitEventKind::Exited,
        });
    }
}

/// Spawn a unit thread for `slot`
///
/// The unit idles until it receives `Init`.
pub(crate) fn spawn_unit(
    slot: usize,
    generation: u64,
    factory: Arc<dyn AnalyzerFactory>,
    event_tx: Sender<UnitEvent>,
) -> std::io::Result<UnitHandle> {
    let (command_tx, command_rx) = crossbeam::channel::unbounded();

    let thread_handle = thread::Builder::new()
        .name(format!("analysis-unit-{}", slot))
        .spawn(move || {
            let unit = Unit {
                slot,
                generation,
                factory,
                command_rx,
                event_tx,
                analyzer: None,
            };
            unit.run();
        })?;

    Ok(UnitHandle {
        command_tx,
        thread_handle: Some(thread_handle),
    })
}

struct Unit {
    slot: usize,
    generation: u64,
    factory: Arc<dyn AnalyzerFactory>,
    command_rx: Receiver<UnitCommand>,
    event_tx: Sender<UnitEvent>,
    analyzer: Option<Box<dyn Analyzer>>,
}

impl Unit {
    fn run(mut self) {
        let _exit = ExitNotice {
            event_tx: self.event_tx.clone(),
            slot: self.slot,
            generation: self.generation,
        };
        log::debug!("Unit {} (gen {}) started", self.slot, self.generation);

        while let Ok(cmd) = self.command_rx.recv() {
            match cmd {
                UnitCommand::Init => {
                    if !self.init() {
                        break;
                    }
                }
                UnitCommand::Analyze { task_id, input, options } => {
                    if !self.analyze(task_id, &input, &options) {
                        break;
                    }
                }
                UnitCommand::Terminate => {
                    log::debug!("Unit {} (gen {}) terminating", self.slot, self.generation);
                    break;
                }
            }
        }
    }

    fn emit(&self, kind: UnitEventKind) {
        let _ = self.event_tx.send(UnitEvent {
            slot: self.slot,
            generation: self.generation,
            kind,
        });
    }

    /// Returns false if the unit should exit
    fn init(&mut self) -> bool {
        let slot = self.slot;
        let factory = Arc::clone(&self.factory);

        let primary_error = match panic::catch_unwind(AssertUnwindSafe(|| factory.create(slot))) {
            Ok(Ok(analyzer)) => {
                log::debug!("Unit {}: {} analyzer ready", slot, analyzer.name());
                self.analyzer = Some(analyzer);
                self.emit(UnitEventKind::Ready { fallback: None });
                return true;
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(payload) => format!("analyzer construction panicked: {}", panic_message(&*payload)),
        };

        match panic::catch_unwind(AssertUnwindSafe(|| factory.fallback(slot))) {
            Ok(Some(analyzer)) => {
                log::warn!(
                    "Unit {}: primary analyzer failed ({}), using {} fallback",
                    slot,
                    primary_error,
                    analyzer.name()
                );
                self.analyzer = Some(analyzer);
                self.emit(UnitEventKind::Ready {
                    fallback: Some(primary_error),
                });
                true
            }
            _ => {
                self.emit(UnitEventKind::InitFailed(primary_error));
                false
            }
        }
    }

    /// Returns false if the unit should exit
    fn analyze(&mut self, task_id: TaskId, input: &AudioInput, options: &AnalysisOptions) -> bool {
        let Some(analyzer) = self.analyzer.as_mut() else {
            self.emit(UnitEventKind::Error {
                task_id,
                message: "execution unit has no analyzer".to_string(),
            });
            return true;
        };

        let (slot, generation) = (self.slot, self.generation);
        let progress_tx = self.event_tx.clone();
        let mut report = |progress: Progress| {
            let _ = progress_tx.send(UnitEvent {
                slot,
                generation,
                kind: UnitEventKind::Progress { task_id, progress },
            });
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| analyzer.analyze(input, options, &mut report)));

        match outcome {
            Ok(Ok(result)) => {
                self.emit(UnitEventKind::Result { task_id, result });
                true
            }
            Ok(Err(e)) => {
                self.emit(UnitEventKind::Error {
                    task_id,
                    message: format!("{:#}", e),
                });
                true
            }
            Err(payload) => {
                let message = format!("analyzer panicked: {}", panic_message(&*payload));
                log::error!("Unit {} (gen {}): {}", slot, generation, message);
                // The analyzer may be half-mutated; never reuse it
                self.analyzer = None;
                self.emit(UnitEventKind::Fault(message));
                false
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
