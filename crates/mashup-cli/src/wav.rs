//! PCM WAV loading for the command line front end

use anyhow::{bail, Context, Result};
use hound::{SampleFormat, WavReader};
use mashup_core::AudioInput;
use std::path::Path;

/// Read a WAV file and downmix it to mono f32 samples
pub fn read_mono(path: &Path) -> Result<AudioInput> {
    let mut reader = WavReader::open(path).with_context(|| format!("Failed to open WAV file: {:?}", path))?;
    let spec = reader.spec();
    if spec.channels == 0 {
        bail!("{:?} declares zero channels", path);
    }

    let interleaved: Vec<f32> = match spec.sample_format {
        SampleFormat::Float => reader
            .samples::<f32>()
            .collect::<Result<_, _>>()
            .with_context(|| format!("Failed to decode {:?}", path))?,
        SampleFormat::Int => {
            let scale = 1.0 / (1u64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()
                .with_context(|| format!("Failed to decode {:?}", path))?
        }
    };

    let mono = downmix(&interleaved, spec.channels as usize);
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    log::debug!(
        "Loaded {:?}: {} Hz, {} channel(s), {} frames",
        path,
        spec.sample_rate,
        spec.channels,
        mono.len()
    );

    Ok(AudioInput::new(name, mono, spec.sample_rate))
}

fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}
