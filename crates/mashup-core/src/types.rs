//! Shared types for analysis requests and results
//!
//! These cross the boundary between the pool coordinator and execution
//! units, and [`AnalysisResult`] is what the result cache persists.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// How thoroughly a track is analyzed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisMode {
    /// Only the opening of the track, coarse resolution
    Quick,
    /// Whole track at normal resolution
    #[default]
    Full,
    /// Whole track at fine resolution
    HighPrecision,
}

/// Number of energy segments produced per track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SegmentDensity {
    Minimal,
    #[default]
    Moderate,
    Detailed,
}

impl SegmentDensity {
    /// Segment count for this density
    pub fn segment_count(self) -> usize {
        match self {
            Self::Minimal => 4,
            Self::Moderate => 8,
            Self::Detailed => 16,
        }
    }
}

/// What the analyzer keeps of the detected beat grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BeatStorage {
    /// Drop beat positions entirely
    None,
    /// Keep only the number of beats
    #[default]
    Count,
    /// Keep every beat position (seconds)
    Full,
}

/// Options passed through to the analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnalysisOptions {
    pub mode: AnalysisMode,
    pub segment_density: SegmentDensity,
    pub beat_storage: BeatStorage,
}

/// Decoded mono audio handed to an execution unit
///
/// Samples are shared read-only, so dispatching a task never copies
/// the buffer.
#[derive(Debug, Clone)]
pub struct AudioInput {
    /// Display name (usually the file name)
    pub name: String,
    /// Mono samples in [-1.0, 1.0]
    pub samples: Arc<[f32]>,
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Duration in seconds
    pub duration_secs: f64,
}

impl AudioInput {
    /// Build an input from owned samples, deriving the duration
    pub fn new(name: impl Into<String>, samples: Vec<f32>, sample_rate: u32) -> Self {
        let duration_secs = if sample_rate == 0 {
            0.0
        } else {
            samples.len() as f64 / sample_rate as f64
        };
        Self {
            name: name.into(),
            samples: samples.into(),
            sample_rate,
            duration_secs,
        }
    }
}

/// Energy of one section of a track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start_secs: f64,
    pub end_secs: f64,
    /// Normalized energy (0.0 - 1.0)
    pub energy: f32,
}

/// Result of analyzing one track
///
/// `bpm` and `key` are required; everything else depends on the options
/// the track was analyzed with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub bpm: f64,
    /// Musical key (e.g., "Am", "C", "F#m")
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub segments: Option<Vec<Segment>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beat_count: Option<usize>,
    /// Beat positions in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub beats: Option<Vec<f64>>,
}

impl AnalysisResult {
    /// Minimal result with only the required fields
    pub fn new(bpm: f64, key: impl Into<String>) -> Self {
        Self {
            bpm,
            key: key.into(),
            energy: None,
            confidence: None,
            segments: None,
            beat_count: None,
            beats: None,
        }
    }
}

/// Progress notification streamed while a task runs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// 0 - 100
    pub percent: u8,
    pub status: String,
}

impl Progress {
    pub fn new(percent: u8, status: impl Into<String>) -> Self {
        Self {
            percent: percent.min(100),
            status: status.into(),
        }
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>3}% {}", self.percent, self.status)
    }
}

/// Callback for task progress (uses Arc for cloneability)
///
/// Runs on the pool's coordinator thread, which is blocked until it
/// returns. Keep it short and never call back into the pool from it:
/// `submit`, `stats`, `cancel`, `wait` or `terminate` inside the callback
/// deadlocks every task in the pool. Forward the progress over a channel
/// instead.
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Identifier of a submitted task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_input_duration() {
        let input = AudioInput::new("tone", vec![0.0; 88_200], 44_100);
        assert_eq!(input.duration_secs, 2.0);
        assert_eq!(input.samples.len(), 88_200);

        let broken = AudioInput::new("broken", vec![0.0; 10], 0);
        assert_eq!(broken.duration_secs, 0.0);
    }

    #[test]
    fn test_options_yaml_names() {
        let options = AnalysisOptions {
            mode: AnalysisMode::HighPrecision,
            segment_density: SegmentDensity::Detailed,
            beat_storage: BeatStorage::None,
        };
        let yaml = serde_yaml::to_string(&options).unwrap();
        assert!(yaml.contains("high_precision"));
        assert!(yaml.contains("detailed"));

        let parsed: AnalysisOptions = serde_yaml::from_str("mode: quick\n").unwrap();
        assert_eq!(parsed.mode, AnalysisMode::Quick);
        assert_eq!(parsed.beat_storage, BeatStorage::Count);
    }

    #[test]
    fn test_result_omits_empty_optionals() {
        let json = serde_json::to_value(AnalysisResult::new(128.0, "Am")).unwrap();
        assert_eq!(json, serde_json::json!({"bpm": 128.0, "key": "Am"}));
    }

    #[test]
    fn test_progress_clamped() {
        assert_eq!(Progress::new(250, "done").percent, 100);
        assert_eq!(Progress::new(42, "tempo").to_string(), " 42% tempo");
    }
}
