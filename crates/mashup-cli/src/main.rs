//! mashup - batch BPM/key/energy analysis from the command line
//!
//! ## Commands
//!
//! - `analyze <FILES>...`: analyze WAV files (cached results are reused)
//! - `purge`: drop persistent cache entries older than the max age
//! - `clear`: empty the result cache
//! - `pool-info`: show how many execution units this host would run
//!
//! Set `RUST_LOG=debug` for per-task output.

mod wav;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use mashup_core::config::{default_config_path, Config};
use mashup_core::pool::{EnvironmentSignals, HostProfilePolicy};
use mashup_core::{
    load_config, AnalysisMode, AnalysisOptions, AnalysisPool, AnalysisRequest, AnalysisService, BasicAnalyzerFactory,
    BeatStorage, FileIdentity, ResultCache, SegmentDensity,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "mashup")]
#[command(about = "Analyze tracks for BPM, key and energy")]
#[command(version)]
struct Args {
    /// Configuration file
    #[arg(short, long, global = true, env = "MASHUP_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Analyze WAV files
    Analyze {
        /// Files to analyze
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Analysis thoroughness (defaults to the configured mode)
        #[arg(short, long, value_enum)]
        mode: Option<ModeArg>,

        /// Number of energy segments
        #[arg(long, value_enum)]
        segments: Option<DensityArg>,

        /// What to keep of the beat grid
        #[arg(long, value_enum)]
        beats: Option<BeatsArg>,

        /// Execution units to run (overrides host sizing)
        #[arg(short, long, env = "MASHUP_WORKERS")]
        workers: Option<usize>,

        /// Print one JSON object per file instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Remove persistent cache entries older than the given age
    Purge {
        /// Maximum age in days (defaults to the configured max age)
        #[arg(long)]
        days: Option<u32>,
    },

    /// Remove every cached result
    Clear,

    /// Show pool sizing for this host
    PoolInfo,
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum ModeArg {
    Quick,
    Full,
    HighPrecision,
}

impl From<ModeArg> for AnalysisMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Quick => AnalysisMode::Quick,
            ModeArg::Full => AnalysisMode::Full,
            ModeArg::HighPrecision => AnalysisMode::HighPrecision,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DensityArg {
    Minimal,
    Moderate,
    Detailed,
}

impl From<DensityArg> for SegmentDensity {
    fn from(arg: DensityArg) -> Self {
        match arg {
            DensityArg::Minimal => SegmentDensity::Minimal,
            DensityArg::Moderate => SegmentDensity::Moderate,
            DensityArg::Detailed => SegmentDensity::Detailed,
        }
    }
}

#[derive(Copy, Clone, Debug, ValueEnum)]
enum BeatsArg {
    None,
    Count,
    Full,
}

impl From<BeatsArg> for BeatStorage {
    fn from(arg: BeatsArg) -> Self {
        match arg {
            BeatsArg::None => BeatStorage::None,
            BeatsArg::Count => BeatStorage::Count,
            BeatsArg::Full => BeatStorage::Full,
        }
    }
}

fn main() -> Result<()> {
    // Initialize logger - set RUST_LOG=debug for verbose output
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .format_timestamp_millis()
        .init();

    let args = Args::parse();
    let config_path = args.config.unwrap_or_else(default_config_path);
    let config = load_config(&config_path);

    match args.command {
        Command::Analyze {
            files,
            mode,
            segments,
            beats,
            workers,
            json,
        } => {
            let mut options = config.analysis;
            if let Some(mode) = mode {
                options.mode = mode.into();
            }
            if let Some(segments) = segments {
                options.segment_density = segments.into();
            }
            if let Some(beats) = beats {
                options.beat_storage = beats.into();
            }
            analyze(config, &files, options, workers, json)
        }
        Command::Purge { days } => {
            let cache = ResultCache::open(&config.cache);
            let days = days.unwrap_or(config.cache.max_age_days);
            let removed = cache.purge_older_than(Duration::from_secs(u64::from(days) * 24 * 60 * 60));
            println!("Removed {} cache entries older than {} days", removed, days);
            Ok(())
        }
        Command::Clear => {
            let cache = ResultCache::open(&config.cache);
            let before = cache.persistent_len();
            cache.clear();
            println!("Cleared {} cached results", before);
            Ok(())
        }
        Command::PoolInfo => {
            pool_info(&config);
            Ok(())
        }
    }
}

fn analyze(
    config: Config,
    files: &[PathBuf],
    options: AnalysisOptions,
    workers: Option<usize>,
    json: bool,
) -> Result<()> {
    // --workers replaces MASHUP_WORKERS rather than the config file value
    let environment = EnvironmentSignals::detect().with_worker_override(workers);
    let pool = AnalysisPool::new(config.pool.clone(), BasicAnalyzerFactory::default()).with_environment(environment);
    let cache = ResultCache::open(&config.cache);
    let service = AnalysisService::new(Arc::new(pool), Arc::new(cache));

    let mut names = Vec::new();
    let mut requests = Vec::new();
    let mut failed = 0usize;
    for path in files {
        match load_request(path) {
            Ok(request) => {
                names.push(path.display().to_string());
                requests.push(request);
            }
            Err(e) => {
                failed += 1;
                eprintln!("{}: {:#}", path.display(), e);
            }
        }
    }

    let started = Instant::now();
    let results = service.analyze_batch(requests, options);

    for (name, outcome) in names.iter().zip(results) {
        match outcome {
            Ok(result) if json => {
                let line = serde_json::json!({ "file": name, "result": result });
                println!("{}", line);
            }
            Ok(result) => {
                let energy = result.energy.map(|e| format!("{:.2}", e)).unwrap_or_else(|| "-".into());
                println!("{:>7.2} BPM  {:<4} energy {:<5} {}", result.bpm, result.key, energy, name);
            }
            Err(e) => {
                failed += 1;
                eprintln!("{}: {}", name, e);
            }
        }
    }

    log::info!("Analyzed {} files in {:?}", files.len(), started.elapsed());
    service.shutdown();

    if failed > 0 {
        bail!("{} of {} files failed", failed, files.len());
    }
    Ok(())
}

fn load_request(path: &Path) -> Result<AnalysisRequest> {
    let identity = FileIdentity::from_path(path).with_context(|| format!("Failed to read metadata of {:?}", path))?;
    let audio = wav::read_mono(path)?;
    Ok(AnalysisRequest::new(identity, audio))
}

fn pool_info(config: &Config) {
    let environment = EnvironmentSignals::detect();
    let pool = AnalysisPool::new(config.pool.clone(), BasicAnalyzerFactory::default());

    println!("Available parallelism: {}", environment.available_parallelism);
    println!("Host profile:          {:?}", HostProfilePolicy::profile(&environment));
    if let Some(n) = environment.worker_override.or(config.pool.worker_override) {
        println!("Worker override:       {}", n);
    }
    println!("Configured maximum:    {}", config.pool.max_workers);
    println!("Execution units:       {}", pool.target_size());
    println!("Task timeout:          {:?}", config.pool.task_timeout());
}
