//! Built-in analyzer: tempo, key, energy and segments
//!
//! ## Tempo
//! A log-compressed spectral-flux-like onset envelope is computed from frame
//! energies, then autocorrelated over the lags that correspond to the
//! configured BPM range. The best lag is refined with parabolic
//! interpolation.
//!
//! ## Key
//! Pitch-class energies (chroma) are measured with Goertzel filters over
//! four octaves on evenly spaced frames, then correlated against the
//! Krumhansl-Kessler major/minor profiles in all twelve rotations.

use super::{Analyzer, AnalyzerFactory};
use crate::types::{AnalysisMode, AnalysisOptions, AnalysisResult, AudioInput, BeatStorage, Progress, Segment};
use anyhow::{bail, Result};
use rayon::prelude::*;

/// Shortest input the analyzer accepts
const MIN_DURATION_SECS: f64 = 2.0;

/// Quick mode only looks at the opening of the track
const QUICK_MODE_SECS: f64 = 60.0;

/// Frames sampled for chroma estimation
const KEY_FRAMES: usize = 48;

/// Octaves (scientific pitch notation) scanned for chroma
const KEY_OCTAVES: std::ops::RangeInclusive<i32> = 3..=6;

const NOTE_NAMES: [&str; 12] = ["C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B"];

const MAJOR_PROFILE: [f64; 12] = [6.35, 2.23, 3.48, 2.33, 4.38, 4.09, 2.52, 5.19, 2.39, 3.66, 2.29, 2.88];
const MINOR_PROFILE: [f64; 12] = [6.33, 2.68, 3.52, 5.38, 2.60, 3.53, 2.54, 4.75, 3.98, 2.69, 3.34, 3.17];

/// Tempo range detected BPMs are folded into
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TempoRange {
    pub min_bpm: f64,
    pub max_bpm: f64,
}

impl Default for TempoRange {
    fn default() -> Self {
        Self {
            min_bpm: 70.0,
            max_bpm: 180.0,
        }
    }
}

impl TempoRange {
    /// Create a range for a specific genre (e.g., DnB: 160-190)
    pub fn new(min_bpm: f64, max_bpm: f64) -> Self {
        let min_bpm = min_bpm.clamp(40.0, 200.0);
        // At least an octave wide so folding always lands inside
        let max_bpm = max_bpm.max(min_bpm * 2.0).min(400.0);
        Self { min_bpm, max_bpm }
    }
}

/// Tempo estimate in envelope frames
struct TempoEstimate {
    bpm: f64,
    confidence: f32,
    /// Envelope frame of the first beat
    phase: usize,
}

pub struct BasicAnalyzer {
    tempo: TempoRange,
    tasks_run: u64,
}

impl BasicAnalyzer {
    pub fn new(tempo: TempoRange) -> Self {
        Self { tempo, tasks_run: 0 }
    }
}

impl Analyzer for BasicAnalyzer {
    fn analyze(
        &mut self,
        input: &AudioInput,
        options: &AnalysisOptions,
        progress: &mut dyn FnMut(Progress),
    ) -> Result<AnalysisResult> {
        if input.sample_rate == 0 || input.samples.is_empty() {
            bail!("'{}' contains no audio", input.name);
        }
        if input.duration_secs < MIN_DURATION_SECS {
            bail!(
                "'{}' is too short for analysis ({:.2}s, need {:.0}s)",
                input.name,
                input.duration_secs,
                MIN_DURATION_SECS
            );
        }
        self.tasks_run += 1;

        let sr = input.sample_rate as f64;
        let (limit, hop) = match options.mode {
            AnalysisMode::Quick => (((QUICK_MODE_SECS * sr) as usize).min(input.samples.len()), 1024),
            AnalysisMode::Full => (input.samples.len(), 512),
            AnalysisMode::HighPrecision => (input.samples.len(), 256),
        };
        let samples = &input.samples[..limit];

        log::debug!(
            "BasicAnalyzer: '{}' ({:.1}s, {:?}, task #{})",
            input.name,
            limit as f64 / sr,
            options.mode,
            self.tasks_run
        );

        progress(Progress::new(5, "Measuring energy"));
        let energy = normalized_energy(rms(samples));

        progress(Progress::new(20, "Detecting tempo"));
        let envelope = onset_envelope(samples, hop);
        let envelope_rate = sr / hop as f64;
        let Some(tempo) = estimate_tempo(&envelope, envelope_rate, &self.tempo) else {
            bail!("no rhythmic content detected in '{}'", input.name);
        };

        progress(Progress::new(55, "Detecting key"));
        let Some(key) = estimate_key(samples, input.sample_rate) else {
            bail!("no tonal content detected in '{}'", input.name);
        };

        progress(Progress::new(80, "Measuring segments"));
        let segments = segment_energies(samples, sr, options.segment_density.segment_count());

        let (beat_count, beats) = match options.beat_storage {
            BeatStorage::None => (None, None),
            BeatStorage::Count | BeatStorage::Full => {
                let first = tempo.phase as f64 / envelope_rate;
                let grid = beat_grid(first, tempo.bpm, limit as f64 / sr);
                let count = grid.len();
                let beats = (options.beat_storage == BeatStorage::Full).then_some(grid);
                (Some(count), beats)
            }
        };

        progress(Progress::new(100, "Done"));

        Ok(AnalysisResult {
            bpm: (tempo.bpm * 100.0).round() / 100.0,
            key,
            energy: Some(energy),
            confidence: Some(tempo.confidence),
            segments: Some(segments),
            beat_count,
            beats,
        })
    }

    fn name(&self) -> &'static str {
        "basic"
    }
}

/// Factory producing a [`BasicAnalyzer`] per unit
#[derive(Debug, Clone, Copy, Default)]
pub struct BasicAnalyzerFactory {
    pub tempo: TempoRange,
}

impl AnalyzerFactory for BasicAnalyzerFactory {
    fn create(&self, _slot: usize) -> Result<Box<dyn Analyzer>> {
        Ok(Box::new(BasicAnalyzer::new(self.tempo)))
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Map RMS to 0..1 over a 60 dB window below full scale
fn normalized_energy(rms: f32) -> f32 {
    if rms <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * rms.log10();
    ((db + 60.0) / 60.0).clamp(0.0, 1.0)
}

/// Positive log-energy differences between consecutive frames
fn onset_envelope(samples: &[f32], hop: usize) -> Vec<f32> {
    let frame = hop * 2;
    if samples.len() < frame {
        return Vec::new();
    }

    let log_energy: Vec<f32> = (0..=(samples.len() - frame) / hop)
        .map(|i| {
            let chunk = &samples[i * hop..i * hop + frame];
            let e: f32 = chunk.iter().map(|s| s * s).sum::<f32>() / frame as f32;
            (1.0 + 1000.0 * e).ln()
        })
        .collect();

    let mut envelope = Vec::with_capacity(log_energy.len());
    envelope.push(0.0);
    for pair in log_energy.windows(2) {
        envelope.push((pair[1] - pair[0]).max(0.0));
    }
    envelope
}

fn estimate_tempo(envelope: &[f32], rate: f64, range: &TempoRange) -> Option<TempoEstimate> {
    let n = envelope.len();
    let lag_min = ((60.0 * rate / range.max_bpm).floor() as usize).max(1);
    let lag_max = ((60.0 * rate / range.min_bpm).ceil() as usize).min(n / 2);
    if lag_min + 1 >= lag_max {
        return None;
    }

    let mean = envelope.iter().sum::<f32>() / n as f32;
    let centered: Vec<f32> = envelope.iter().map(|v| v - mean).collect();

    let zero_lag = centered.iter().map(|v| v * v).sum::<f32>() / n as f32;
    if zero_lag <= 1e-9 {
        return None;
    }

    let autocorr = |lag: usize| -> f32 {
        let sum: f32 = centered[..n - lag]
            .iter()
            .zip(&centered[lag..])
            .map(|(a, b)| a * b)
            .sum();
        sum / (n - lag) as f32
    };

    let scores: Vec<f32> = (lag_min..=lag_max).map(autocorr).collect();
    let (best_idx, best) = scores
        .iter()
        .copied()
        .enumerate()
        .max_by(|a, b| a.1.total_cmp(&b.1))?;
    if best <= 0.0 {
        return None;
    }

    let mut lag = (lag_min + best_idx) as f64;
    if best_idx > 0 && best_idx + 1 < scores.len() {
        let (a, b, c) = (scores[best_idx - 1], best, scores[best_idx + 1]);
        let denom = a - 2.0 * b + c;
        if denom.abs() > f32::EPSILON {
            lag += (0.5 * (a - c) / denom).clamp(-0.5, 0.5) as f64;
        }
    }

    let mut bpm = 60.0 * rate / lag;
    while bpm < range.min_bpm {
        bpm *= 2.0;
    }
    while bpm > range.max_bpm {
        bpm /= 2.0;
    }

    // Beat phase: offset whose comb of beat positions collects most onset energy
    let period = (lag_min + best_idx).max(1);
    let phase = (0..period)
        .max_by(|&a, &b| {
            let sa: f32 = envelope.iter().skip(a).step_by(period).sum();
            let sb: f32 = envelope.iter().skip(b).step_by(period).sum();
            sa.total_cmp(&sb)
        })
        .unwrap_or(0);

    Some(TempoEstimate {
        bpm,
        confidence: (best / zero_lag).clamp(0.0, 1.0),
        phase,
    })
}

/// Goertzel power of `freq` in `frame`
fn goertzel(frame: &[f32], freq: f64, sample_rate: f64) -> f64 {
    let omega = 2.0 * std::f64::consts::PI * freq / sample_rate;
    let coeff = 2.0 * omega.cos();
    let (mut s1, mut s2) = (0.0f64, 0.0f64);
    for &x in frame {
        let s0 = x as f64 + coeff * s1 - s2;
        s2 = s1;
        s1 = s0;
    }
    s1 * s1 + s2 * s2 - coeff * s1 * s2
}

fn pitch_frequency(pitch_class: usize, octave: i32) -> f64 {
    let midi = 12 * (octave + 1) + pitch_class as i32;
    440.0 * 2f64.powf((midi - 69) as f64 / 12.0)
}

fn chroma(samples: &[f32], sample_rate: u32) -> [f64; 12] {
    let sr = sample_rate as f64;
    let frame_len = ((sr / 5.0) as usize).clamp(1, samples.len());
    let span = samples.len() - frame_len;
    let frame_count = if span == 0 { 1 } else { KEY_FRAMES };
    let starts: Vec<usize> = (0..frame_count)
        .map(|i| if frame_count == 1 { 0 } else { span * i / (frame_count - 1) })
        .collect();

    let energies: Vec<f64> = (0..12usize)
        .into_par_iter()
        .map(|pc| {
            starts
                .iter()
                .map(|&start| {
                    let frame = &samples[start..start + frame_len];
                    KEY_OCTAVES
                        .map(|octave| {
                            let freq = pitch_frequency(pc, octave);
                            if freq >= sr / 2.0 {
                                0.0
                            } else {
                                goertzel(frame, freq, sr).sqrt()
                            }
                        })
                        .sum::<f64>()
                })
                .sum::<f64>()
        })
        .collect();

    let mut out = [0.0; 12];
    out.copy_from_slice(&energies);
    out
}

fn correlation(a: &[f64; 12], b: &[f64; 12]) -> f64 {
    let mean_a = a.iter().sum::<f64>() / 12.0;
    let mean_b = b.iter().sum::<f64>() / 12.0;
    let (mut num, mut da, mut db) = (0.0, 0.0, 0.0);
    for i in 0..12 {
        let x = a[i] - mean_a;
        let y = b[i] - mean_b;
        num += x * y;
        da += x * x;
        db += y * y;
    }
    if da <= 0.0 || db <= 0.0 {
        return 0.0;
    }
    num / (da * db).sqrt()
}

fn estimate_key(samples: &[f32], sample_rate: u32) -> Option<String> {
    let chroma = chroma(samples, sample_rate);
    let total: f64 = chroma.iter().sum();
    if total <= 1e-6 || !total.is_finite() {
        return None;
    }

    let mut best: Option<(f64, String)> = None;
    for tonic in 0..12 {
        for (profile, suffix) in [(&MAJOR_PROFILE, ""), (&MINOR_PROFILE, "m")] {
            let mut rotated = [0.0; 12];
            for (i, value) in profile.iter().enumerate() {
                rotated[(i + tonic) % 12] = *value;
            }
            let score = correlation(&chroma, &rotated);
            if best.as_ref().map_or(true, |(s, _)| score > *s) {
                best = Some((score, format!("{}{}", NOTE_NAMES[tonic], suffix)));
            }
        }
    }
    best.map(|(_, key)| key)
}

fn segment_energies(samples: &[f32], sample_rate: f64, count: usize) -> Vec<Segment> {
    let count = count.clamp(1, samples.len().max(1));
    let len = samples.len() / count;
    (0..count)
        .map(|i| {
            let start = i * len;
            let end = if i + 1 == count { samples.len() } else { start + len };
            Segment {
                start_secs: start as f64 / sample_rate,
                end_secs: end as f64 / sample_rate,
                energy: normalized_energy(rms(&samples[start..end])),
            }
        })
        .collect()
}

/// Fixed beat grid from the first beat to the end of the analyzed audio
fn beat_grid(first_beat_secs: f64, bpm: f64, duration_secs: f64) -> Vec<f64> {
    let period = 60.0 / bpm;
    let mut beats = Vec::new();
    let mut t = first_beat_secs;
    while t < duration_secs {
        beats.push((t * 1000.0).round() / 1000.0);
        t += period;
    }
    beats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SegmentDensity;

    const SR: u32 = 44_100;

    /// Decaying 1 kHz bursts at the given tempo
    fn click_track(bpm: f64, seconds: f64) -> Vec<f32> {
        let total = (seconds * SR as f64) as usize;
        let period = (60.0 / bpm * SR as f64) as usize;
        let burst = SR as usize / 50;
        (0..total)
            .map(|i| {
                let pos = i % period;
                if pos < burst {
                    let t = pos as f32 / SR as f32;
                    (2.0 * std::f32::consts::PI * 1000.0 * t).sin() * (-(pos as f32) / 200.0).exp() * 0.8
                } else {
                    0.0
                }
            })
            .collect()
    }

    fn chord(freqs: &[f64], seconds: f64) -> Vec<f32> {
        let total = (seconds * SR as f64) as usize;
        (0..total)
            .map(|i| {
                let t = i as f64 / SR as f64;
                let sum: f64 = freqs.iter().map(|f| (2.0 * std::f64::consts::PI * f * t).sin()).sum();
                (sum / freqs.len() as f64 * 0.5) as f32
            })
            .collect()
    }

    #[test]
    fn test_detects_click_track_tempo() {
        let envelope = onset_envelope(&click_track(120.0, 20.0), 512);
        let tempo = estimate_tempo(&envelope, SR as f64 / 512.0, &TempoRange::default()).unwrap();
        assert!((tempo.bpm - 120.0).abs() < 2.0, "got {}", tempo.bpm);
        assert!(tempo.confidence > 0.0);
    }

    #[test]
    fn test_flat_envelope_has_no_tempo() {
        let envelope = vec![0.0f32; 2000];
        assert!(estimate_tempo(&envelope, 86.0, &TempoRange::default()).is_none());
    }

    #[test]
    fn test_detects_a_minor_triad() {
        let samples = chord(&[220.0, 261.63, 329.63], 4.0);
        assert_eq!(estimate_key(&samples, SR).as_deref(), Some("Am"));
    }

    #[test]
    fn test_detects_c_major_triad() {
        let samples = chord(&[261.63, 329.63, 392.0], 4.0);
        assert_eq!(estimate_key(&samples, SR).as_deref(), Some("C"));
    }

    #[test]
    fn test_silence_has_no_key() {
        assert!(estimate_key(&vec![0.0; SR as usize], SR).is_none());
    }

    #[test]
    fn test_energy_mapping() {
        assert_eq!(normalized_energy(0.0), 0.0);
        assert_eq!(normalized_energy(1.0), 1.0);
        assert!((normalized_energy(0.001) - 0.0).abs() < 1e-3);
        assert!(normalized_energy(0.1) > 0.5);
    }

    #[test]
    fn test_segments_cover_input() {
        let samples = vec![0.5f32; SR as usize * 8];
        let segments = segment_energies(&samples, SR as f64, SegmentDensity::Moderate.segment_count());
        assert_eq!(segments.len(), 8);
        assert_eq!(segments[0].start_secs, 0.0);
        assert_eq!(segments.last().unwrap().end_secs, 8.0);
    }

    #[test]
    fn test_beat_grid_spacing() {
        let grid = beat_grid(0.25, 120.0, 2.0);
        assert_eq!(grid, vec![0.25, 0.75, 1.25, 1.75]);
    }

    #[test]
    fn test_analyze_rejects_short_input() {
        let mut analyzer = BasicAnalyzer::new(TempoRange::default());
        let input = AudioInput::new("blip", vec![0.1; 1000], SR);
        let err = analyzer
            .analyze(&input, &AnalysisOptions::default(), &mut |_| {})
            .unwrap_err();
        assert!(err.to_string().contains("too short"));
    }

    #[test]
    fn test_analyze_click_track_end_to_end() {
        let mut analyzer = BasicAnalyzer::new(TempoRange::default());
        let mut samples = click_track(125.0, 12.0);
        // Add a sustained A minor pad under the clicks
        for (s, c) in samples.iter_mut().zip(chord(&[220.0, 261.63, 329.63], 12.0)) {
            *s += c * 0.3;
        }
        let input = AudioInput::new("clicks.wav", samples, SR);
        let options = AnalysisOptions {
            beat_storage: BeatStorage::Full,
            ..AnalysisOptions::default()
        };

        let mut seen = Vec::new();
        let result = analyzer
            .analyze(&input, &options, &mut |p| seen.push(p.percent))
            .unwrap();

        assert!((result.bpm - 125.0).abs() < 2.5, "got {}", result.bpm);
        assert_eq!(result.key, "Am");
        assert_eq!(result.beats.as_ref().map(Vec::len), result.beat_count);
        assert_eq!(result.segments.as_ref().map(Vec::len), Some(8));
        assert_eq!(seen.last(), Some(&100));
        assert!(seen.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_tempo_range_is_at_least_an_octave() {
        let range = TempoRange::new(160.0, 190.0);
        assert_eq!(range.min_bpm, 160.0);
        assert_eq!(range.max_bpm, 320.0);
    }
}
