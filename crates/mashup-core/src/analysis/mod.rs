//! Analyzer abstraction run inside execution units
//!
//! The pool treats analysis as opaque: each execution unit owns one
//! [`Analyzer`] built by an [`AnalyzerFactory`] during the unit's init
//! handshake. Analyzers may keep state between tasks (model handles,
//! scratch buffers) because a unit never runs two tasks at once.
//!
//! [`BasicAnalyzer`] is a pure-Rust implementation (tempo from
//! onset autocorrelation, key from chroma profiles, RMS energy).

pub mod basic;

pub use basic::{BasicAnalyzer, BasicAnalyzerFactory, TempoRange};

use crate::types::{AnalysisOptions, AnalysisResult, AudioInput, Progress};

/// A stateful analysis backend owned by one execution unit
pub trait Analyzer: Send {
    /// Analyze one input, streaming progress as it goes
    fn analyze(
        &mut self,
        input: &AudioInput,
        options: &AnalysisOptions,
        progress: &mut dyn FnMut(Progress),
    ) -> anyhow::Result<AnalysisResult>;

    /// Get the name of this analyzer (for logging)
    fn name(&self) -> &'static str;
}

/// Builds analyzers for execution units
///
/// `create` runs on the unit's own thread during initialization. If it
/// fails, `fallback` gets a chance to supply a simpler analyzer so the
/// slot still comes up.
pub trait AnalyzerFactory: Send + Sync + 'static {
    fn create(&self, slot: usize) -> anyhow::Result<Box<dyn Analyzer>>;

    fn fallback(&self, _slot: usize) -> Option<Box<dyn Analyzer>> {
        None
    }
}

impl<F> AnalyzerFactory for F
where
    F: Fn(usize) -> anyhow::Result<Box<dyn Analyzer>> + Send + Sync + 'static,
{
    fn create(&self, slot: usize) -> anyhow::Result<Box<dyn Analyzer>> {
        self(slot)
    }
}
