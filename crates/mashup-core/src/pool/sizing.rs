//! Pool sizing from the host environment
//!
//! The number of execution units is decided once per initialization:
//!
//! ```text
//! target = max(1, min(max_workers, override ?? profile ceiling, available parallelism))
//! ```
//!
//! Environment signals only affect throughput. Any combination of them
//! yields a usable pool of at least one unit.

use crate::config::PoolConfig;
use std::thread;

/// Explicit unit count (positive integer)
pub const WORKERS_ENV: &str = "MASHUP_WORKERS";

/// Set to a truthy value on small shared hosts (CI runners, containers)
pub const CONSTRAINED_HOST_ENV: &str = "MASHUP_CONSTRAINED_HOST";

/// Inputs the capacity policy decides from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvironmentSignals {
    pub available_parallelism: usize,
    pub worker_override: Option<usize>,
    pub constrained_host: bool,
}

impl EnvironmentSignals {
    /// Read the signals from the running process
    pub fn detect() -> Self {
        let available = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        Self::from_values(
            available,
            std::env::var(WORKERS_ENV).ok().as_deref(),
            std::env::var(CONSTRAINED_HOST_ENV).ok().as_deref(),
        )
    }

    /// Apply an explicit unit count from the caller, such as a command line flag
    ///
    /// It takes the place of `MASHUP_WORKERS`; `None` (or zero) keeps what
    /// the environment said.
    pub fn with_worker_override(mut self, workers: Option<usize>) -> Self {
        if let Some(n) = workers.filter(|&n| n > 0) {
            self.worker_override = Some(n);
        }
        self
    }

    fn from_values(available: usize, workers: Option<&str>, constrained: Option<&str>) -> Self {
        let worker_override = workers.and_then(|raw| match raw.trim().parse::<usize>() {
            Ok(n) if n > 0 => Some(n),
            _ => {
                log::warn!("Ignoring invalid {}={:?}", WORKERS_ENV, raw);
                None
            }
        });

        let constrained_host = constrained
            .map(|raw| matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        Self {
            available_parallelism: available.max(1),
            worker_override,
            constrained_host,
        }
    }
}

/// Host class recognized by [`HostProfilePolicy`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostProfile {
    /// Small fixed ceiling regardless of reported cores
    Constrained,
    /// Leave one core for the UI and audio threads
    General,
}

/// Decides how many execution units a pool runs
pub trait CapacityPolicy: Send + Sync {
    fn target_size(&self, config: &PoolConfig, env: &EnvironmentSignals) -> usize;
}

/// Default policy: constrained hosts get a fixed ceiling, others N-1 cores
#[derive(Debug, Clone, Copy, Default)]
pub struct HostProfilePolicy;

impl HostProfilePolicy {
    pub fn profile(env: &EnvironmentSignals) -> HostProfile {
        if env.constrained_host {
            HostProfile::Constrained
        } else {
            HostProfile::General
        }
    }

    fn ceiling(config: &PoolConfig, env: &EnvironmentSignals) -> usize {
        match Self::profile(env) {
            HostProfile::Constrained => config.constrained_ceiling,
            HostProfile::General => env.available_parallelism.saturating_sub(1),
        }
    }
}

impl CapacityPolicy for HostProfilePolicy {
    fn target_size(&self, config: &PoolConfig, env: &EnvironmentSignals) -> usize {
        // Environment override beats the config file
        let requested = env
            .worker_override
            .or(config.worker_override)
            .unwrap_or_else(|| Self::ceiling(config, env));

        requested
            .min(config.max_workers)
            .min(env.available_parallelism)
            .max(1)
    }
}

/// A policy that always answers the same size
///
/// The pool still clamps the answer to the configured maximum and the
/// available parallelism.
#[derive(Debug, Clone, Copy)]
pub struct FixedCapacity(pub usize);

impl CapacityPolicy for FixedCapacity {
    fn target_size(&self, _config: &PoolConfig, _env: &EnvironmentSignals) -> usize {
        self.0.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(available: usize, worker_override: Option<usize>, constrained_host: bool) -> EnvironmentSignals {
        EnvironmentSignals {
            available_parallelism: available,
            worker_override,
            constrained_host,
        }
    }

    #[test]
    fn test_sizing_table() {
        let config = PoolConfig::default(); // max 8, constrained ceiling 2
        let cases = [
            // (available, override, constrained, expected)
            (1, None, false, 1),
            (2, None, false, 1),
            (4, None, false, 3),
            (16, None, false, 8),
            (16, None, true, 2),
            (1, None, true, 1),
            (16, Some(4), false, 4),
            (16, Some(4), true, 4),
            (16, Some(32), false, 8),
            (3, Some(6), false, 3),
        ];

        for (available, worker_override, constrained, expected) in cases {
            let signals = env(available, worker_override, constrained);
            assert_eq!(
                HostProfilePolicy.target_size(&config, &signals),
                expected,
                "{:?}",
                signals
            );
        }
    }

    #[test]
    fn test_config_override_used_when_env_silent() {
        let config = PoolConfig {
            worker_override: Some(3),
            ..PoolConfig::default()
        };
        assert_eq!(HostProfilePolicy.target_size(&config, &env(16, None, false)), 3);
        assert_eq!(HostProfilePolicy.target_size(&config, &env(16, Some(5), false)), 5);
    }

    #[test]
    fn test_caller_override_beats_environment() {
        let config = PoolConfig {
            worker_override: Some(4),
            ..PoolConfig::default()
        };
        let from_env = env(16, Some(6), false);
        assert_eq!(HostProfilePolicy.target_size(&config, &from_env), 6);

        let flagged = from_env.with_worker_override(Some(2));
        assert_eq!(HostProfilePolicy.target_size(&config, &flagged), 2);

        // No flag leaves the environment value alone
        assert_eq!(from_env.with_worker_override(None), from_env);
        assert_eq!(from_env.with_worker_override(Some(0)), from_env);
    }

    #[test]
    fn test_parse_environment_values() {
        let signals = EnvironmentSignals::from_values(8, Some(" 3 "), Some("TRUE"));
        assert_eq!(signals.worker_override, Some(3));
        assert!(signals.constrained_host);

        let signals = EnvironmentSignals::from_values(0, Some("zero"), Some("0"));
        assert_eq!(signals.available_parallelism, 1);
        assert_eq!(signals.worker_override, None);
        assert!(!signals.constrained_host);

        let signals = EnvironmentSignals::from_values(4, Some("0"), None);
        assert_eq!(signals.worker_override, None);
    }

    #[test]
    fn test_profile_detection() {
        assert_eq!(HostProfilePolicy::profile(&env(4, None, true)), HostProfile::Constrained);
        assert_eq!(HostProfilePolicy::profile(&env(4, None, false)), HostProfile::General);
    }

    #[test]
    fn test_fixed_capacity_never_zero() {
        let signals = env(4, None, false);
        assert_eq!(FixedCapacity(0).target_size(&PoolConfig::default(), &signals), 1);
        assert_eq!(FixedCapacity(3).target_size(&PoolConfig::default(), &signals), 3);
    }
}
