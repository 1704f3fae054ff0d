//! Configuration for the analysis pool and result cache
//!
//! Configuration is stored as YAML.
//! Default location: ~/.config/mashup/config.yaml

use crate::types::AnalysisOptions;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool sizing, timeouts and restart policy
    pub pool: PoolConfig,
    /// Result cache settings
    pub cache: CacheConfig,
    /// Default analysis options
    pub analysis: AnalysisOptions,
}

impl Config {
    pub fn validate(&mut self) {
        self.pool.validate();
        self.cache.validate();
    }
}

/// Pool configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Upper bound on execution units regardless of hardware (1-64)
    pub max_workers: usize,
    /// Explicit unit count; still clamped to max_workers and CPU count
    pub worker_override: Option<usize>,
    /// Ceiling used on constrained hosts
    pub constrained_ceiling: usize,
    /// Time a unit has to acknowledge initialization
    pub init_timeout_ms: u64,
    /// Time budget for one analysis task
    pub task_timeout_ms: u64,
    /// Restarts per slot before restarts are reported as flapping
    pub max_restarts: u32,
    /// First restart delay; doubles per restart of the same slot
    pub restart_backoff_ms: u64,
    /// Cap on the restart delay
    pub restart_backoff_max_ms: u64,
    /// Time units get to stop on shutdown before they are detached
    pub shutdown_grace_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 8,
            worker_override: None,
            constrained_ceiling: 2,
            init_timeout_ms: 10_000,
            task_timeout_ms: 70_000,
            max_restarts: 3,
            restart_backoff_ms: 100,
            restart_backoff_max_ms: 5_000,
            shutdown_grace_ms: 2_000,
        }
    }
}

impl PoolConfig {
    /// Clamp values to sane ranges
    pub fn validate(&mut self) {
        self.max_workers = self.max_workers.clamp(1, 64);
        self.constrained_ceiling = self.constrained_ceiling.clamp(1, self.max_workers);
        if let Some(n) = self.worker_override {
            self.worker_override = Some(n.max(1));
        }
        self.init_timeout_ms = self.init_timeout_ms.max(10);
        self.task_timeout_ms = self.task_timeout_ms.max(10);
        self.restart_backoff_max_ms = self.restart_backoff_max_ms.max(self.restart_backoff_ms);
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_millis(self.task_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Delay before the `restart_number`-th restart of a slot (1-based)
    pub fn restart_backoff(&self, restart_number: u32) -> Duration {
        let exponent = restart_number.saturating_sub(1).min(16);
        let delay = self.restart_backoff_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.restart_backoff_max_ms))
    }
}

/// Cache configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Keep results on disk between sessions
    pub persistent: bool,
    /// Store location; defaults to the user cache directory
    pub store_path: Option<PathBuf>,
    /// Entries kept in memory before the oldest is evicted
    pub memory_capacity: usize,
    /// Entries older than this are ignored and purged
    pub max_age_days: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            persistent: true,
            store_path: None,
            memory_capacity: 500,
            max_age_days: 30,
        }
    }
}

impl CacheConfig {
    pub fn validate(&mut self) {
        self.memory_capacity = self.memory_capacity.max(1);
        self.max_age_days = self.max_age_days.max(1);
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.max_age_days) * 24 * 60 * 60)
    }

    pub fn resolved_store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(default_store_path)
    }
}

/// Get the default config file path
///
/// Returns: ~/.config/mashup/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mashup")
        .join("config.yaml")
}

/// Get the default persistent cache path
///
/// Returns: ~/.cache/mashup/analysis.db
pub fn default_store_path() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("mashup")
        .join("analysis.db")
}

/// Load configuration from a YAML file
///
/// If the file doesn't exist, returns default config.
/// If the file exists but is invalid, logs a warning and returns default config.
pub fn load_config(path: &Path) -> Config {
    log::info!("load_config: Loading from {:?}", path);

    if !path.exists() {
        log::info!("load_config: Config file doesn't exist, using defaults");
        return Config::default();
    }

    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_yaml::from_str::<Config>(&contents) {
            Ok(mut config) => {
                config.validate();
                log::info!(
                    "load_config: Loaded config - max workers: {}, task timeout: {}ms",
                    config.pool.max_workers,
                    config.pool.task_timeout_ms
                );
                config
            }
            Err(e) => {
                log::warn!("load_config: Failed to parse config: {}, using defaults", e);
                Config::default()
            }
        },
        Err(e) => {
            log::warn!("load_config: Failed to read config file: {}, using defaults", e);
            Config::default()
        }
    }
}

/// Save configuration to a YAML file
///
/// Creates parent directories if they don't exist.
pub fn save_config(config: &Config, path: &Path) -> Result<()> {
    log::info!("save_config: Saving to {:?}", path);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
    }

    let yaml = serde_yaml::to_string(config).context("Failed to serialize config to YAML")?;

    std::fs::write(path, yaml).with_context(|| format!("Failed to write config file: {:?}", path))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnalysisMode;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.pool.task_timeout(), Duration::from_secs(70));
        assert_eq!(config.cache.max_age(), Duration::from_secs(30 * 24 * 60 * 60));
        assert!(config.cache.persistent);
    }

    #[test]
    fn test_pool_validation_clamps_values() {
        let mut pool = PoolConfig {
            max_workers: 0,
            worker_override: Some(0),
            constrained_ceiling: 10,
            restart_backoff_ms: 500,
            restart_backoff_max_ms: 100,
            ..PoolConfig::default()
        };
        pool.validate();
        assert_eq!(pool.max_workers, 1);
        assert_eq!(pool.worker_override, Some(1));
        assert_eq!(pool.constrained_ceiling, 1);
        assert_eq!(pool.restart_backoff_max_ms, 500);
    }

    #[test]
    fn test_restart_backoff_doubles_and_caps() {
        let pool = PoolConfig {
            restart_backoff_ms: 100,
            restart_backoff_max_ms: 500,
            ..PoolConfig::default()
        };
        assert_eq!(pool.restart_backoff(1), Duration::from_millis(100));
        assert_eq!(pool.restart_backoff(2), Duration::from_millis(200));
        assert_eq!(pool.restart_backoff(3), Duration::from_millis(400));
        assert_eq!(pool.restart_backoff(4), Duration::from_millis(500));
        assert_eq!(pool.restart_backoff(60), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = "pool:\n  max_workers: 3\nanalysis:\n  mode: quick\n";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.pool.max_workers, 3);
        assert_eq!(config.pool.task_timeout_ms, 70_000);
        assert_eq!(config.analysis.mode, AnalysisMode::Quick);
        assert_eq!(config.cache.memory_capacity, 500);
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yaml");

        let mut config = Config::default();
        config.pool.worker_override = Some(2);
        config.cache.max_age_days = 7;
        save_config(&config, &path).unwrap();

        let loaded = load_config(&path);
        assert_eq!(loaded.pool.worker_override, Some(2));
        assert_eq!(loaded.cache.max_age_days, 7);
    }

    #[test]
    fn test_invalid_yaml_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "pool: [not, a, map").unwrap();

        let config = load_config(&path);
        assert_eq!(config.pool.max_workers, PoolConfig::default().max_workers);
    }
}
