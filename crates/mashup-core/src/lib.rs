//! Mashup Core - analysis pool and result cache for DJ track analysis
//!
//! Tracks are analyzed (BPM, key, energy) on a bounded pool of execution
//! units and the results are memoized per file fingerprint in a two-tier
//! cache. [`AnalysisService`] is the entry point; the other modules are
//! exposed for callers that need finer control.

pub mod analysis;
pub mod cache;
pub mod config;
pub mod error;
pub mod fingerprint;
pub mod pool;
pub mod service;
pub mod types;

pub use analysis::{Analyzer, AnalyzerFactory, BasicAnalyzer, BasicAnalyzerFactory};
pub use cache::ResultCache;
pub use config::{load_config, save_config, Config};
pub use error::{AnalysisError, Result};
pub use fingerprint::{fingerprint, FileIdentity};
pub use pool::{AnalysisPool, PoolEvent, PoolStats, TaskHandle};
pub use service::{AnalysisRequest, AnalysisService};
pub use types::*;
