//! Error types for analysis tasks

use std::time::Duration;
use thiserror::Error;

/// Errors delivered to the caller of an analysis task
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AnalysisError {
    #[error("Execution unit {slot} did not become ready within {timeout:?}")]
    InitializationTimeout { slot: usize, timeout: Duration },

    #[error("No execution unit could be initialized")]
    NoUnitsAvailable,

    #[error("Analysis timed out after {0:?}")]
    TaskTimeout(Duration),

    #[error("Execution unit {slot} faulted: {message}")]
    UnitFault { slot: usize, message: String },

    #[error("Analyzer error: {0}")]
    Analyzer(String),

    #[error("Analyzer returned an invalid result: {0}")]
    InvalidResult(String),

    #[error("Analysis pool is shutting down")]
    PoolShuttingDown,

    #[error("Analysis task was cancelled")]
    Cancelled,

    #[error("Analysis pool unavailable: {0}")]
    PoolUnavailable(String),
}

impl AnalysisError {
    /// True for failures caused by the execution unit rather than the input
    ///
    /// Re-submitting after one of these is safe and will usually succeed
    /// on a fresh unit.
    pub fn is_unit_failure(&self) -> bool {
        matches!(self, Self::TaskTimeout(_) | Self::UnitFault { .. })
    }

    /// True when the analyzer itself rejected the input or produced garbage
    pub fn is_analyzer_failure(&self) -> bool {
        matches!(self, Self::Analyzer(_) | Self::InvalidResult(_))
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;
