//! AnalysisService - the entry point for analyzing tracks
//!
//! Combines the result cache and the worker pool:
//!
//! 1. Fingerprint the file identity
//! 2. Return a valid cached result without touching the pool
//! 3. Otherwise run the analysis on the pool (initializing it if needed)
//! 4. Cache successful results; failures are never cached

use crate::analysis::AnalyzerFactory;
use crate::cache::ResultCache;
use crate::config::Config;
use crate::error::Result;
use crate::fingerprint::{fingerprint, FileIdentity};
use crate::pool::{AnalysisPool, TaskHandle};
use crate::types::{AnalysisOptions, AnalysisResult, AudioInput, ProgressCallback};
use std::sync::Arc;

/// One track to analyze
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    /// Where the audio came from; this is what the cache is keyed by
    pub identity: FileIdentity,
    pub audio: AudioInput,
}

impl AnalysisRequest {
    pub fn new(identity: FileIdentity, audio: AudioInput) -> Self {
        Self { identity, audio }
    }
}

/// Cache-aware front end to the analysis pool
#[derive(Clone)]
pub struct AnalysisService {
    pool: Arc<AnalysisPool>,
    cache: Arc<ResultCache>,
}

impl AnalysisService {
    pub fn new(pool: Arc<AnalysisPool>, cache: Arc<ResultCache>) -> Self {
        Self { pool, cache }
    }

    /// Build the pool and cache described by a configuration
    pub fn from_config(config: &Config, factory: impl AnalyzerFactory) -> Self {
        let pool = AnalysisPool::new(config.pool.clone(), factory);
        let cache = ResultCache::open(&config.cache);
        Self::new(Arc::new(pool), Arc::new(cache))
    }

    pub fn pool(&self) -> &Arc<AnalysisPool> {
        &self.pool
    }

    pub fn cache(&self) -> &Arc<ResultCache> {
        &self.cache
    }

    /// Analyze one track, consulting the cache first
    ///
    /// A cache hit returns immediately and reports no progress. Errors
    /// from the pool are returned unchanged.
    pub fn analyze(
        &self,
        request: AnalysisRequest,
        options: AnalysisOptions,
        on_progress: Option<ProgressCallback>,
    ) -> Result<AnalysisResult> {
        let key = fingerprint(&request.identity);
        if let Some(hit) = self.cache.get(&key) {
            log::debug!("Cache hit for '{}'", request.identity.name);
            return Ok(hit);
        }

        log::debug!("Cache miss for '{}', submitting to pool", request.identity.name);
        let result = self.pool.submit(request.audio, options, on_progress)?.wait()?;
        self.store(&key, &result);
        Ok(result)
    }

    /// Analyze many tracks, returning one outcome per request in order
    ///
    /// Cache hits resolve inline. All misses are submitted before any is
    /// awaited so they run in parallel up to the pool's size. One failure
    /// does not affect the others.
    pub fn analyze_batch(
        &self,
        requests: Vec<AnalysisRequest>,
        options: AnalysisOptions,
    ) -> Vec<Result<AnalysisResult>> {
        enum Pending {
            Done(Result<AnalysisResult>),
            Running { key: String, handle: TaskHandle },
        }

        let total = requests.len();
        let pending: Vec<Pending> = requests
            .into_iter()
            .map(|request| {
                let key = fingerprint(&request.identity);
                if let Some(hit) = self.cache.get(&key) {
                    return Pending::Done(Ok(hit));
                }
                match self.pool.submit(request.audio, options, None) {
                    Ok(handle) => Pending::Running { key, handle },
                    Err(e) => Pending::Done(Err(e)),
                }
            })
            .collect();

        let running = pending.iter().filter(|p| matches!(p, Pending::Running { .. })).count();
        log::info!(
            "Batch analysis: {} tracks, {} cached, {} submitted",
            total,
            total - running,
            running
        );

        pending
            .into_iter()
            .map(|p| match p {
                Pending::Done(outcome) => outcome,
                Pending::Running { key, handle } => {
                    let outcome = handle.wait();
                    if let Ok(result) = &outcome {
                        self.store(&key, result);
                    }
                    outcome
                }
            })
            .collect()
    }

    fn store(&self, key: &str, result: &AnalysisResult) {
        if !self.cache.put(key, result) {
            log::warn!("Analysis result for {} was not cached", key);
        }
    }

    /// Stop the pool; the cache stays usable
    pub fn shutdown(&self) {
        self.pool.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::Analyzer;
    use crate::cache::CozoStore;
    use crate::config::PoolConfig;
    use crate::error::AnalysisError;
    use crate::pool::EnvironmentSignals;
    use crate::types::Progress;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Returns a result derived from the input name; `fail` errors
    struct Counting {
        runs: Arc<AtomicUsize>,
    }

    impl Analyzer for Counting {
        fn analyze(
            &mut self,
            input: &AudioInput,
            _options: &AnalysisOptions,
            progress: &mut dyn FnMut(Progress),
        ) -> anyhow::Result<AnalysisResult> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            progress(Progress::new(50, "counting"));
            match input.name.as_str() {
                "fail" => anyhow::bail!("decoder rejected input"),
                "zero" => Ok(AnalysisResult::new(0.0, "Am")),
                name => Ok(AnalysisResult::new(100.0 + name.len() as f64, "Am")),
            }
        }

        fn name(&self) -> &'static str {
            "counting"
        }
    }

    fn service_with_store(store: Arc<CozoStore>) -> (AnalysisService, Arc<AtomicUsize>) {
        let runs = Arc::new(AtomicUsize::new(0));
        let factory = {
            let runs = Arc::clone(&runs);
            move |_slot: usize| -> anyhow::Result<Box<dyn Analyzer>> {
                Ok(Box::new(Counting {
                    runs: Arc::clone(&runs),
                }))
            }
        };
        let pool = AnalysisPool::new(
            PoolConfig {
                worker_override: Some(2),
                shutdown_grace_ms: 200,
                ..PoolConfig::default()
            },
            factory,
        )
        .with_environment(EnvironmentSignals {
            available_parallelism: 4,
            worker_override: None,
            constrained_host: false,
        });
        let cache = ResultCache::new(16, Duration::from_secs(30 * 24 * 60 * 60), store);
        (AnalysisService::new(Arc::new(pool), Arc::new(cache)), runs)
    }

    fn service() -> (AnalysisService, Arc<AtomicUsize>) {
        service_with_store(Arc::new(CozoStore::in_memory().unwrap()))
    }

    fn request(name: &str, modified_ms: i64) -> AnalysisRequest {
        AnalysisRequest::new(
            FileIdentity::new(name, 1024, modified_ms),
            AudioInput::new(name, vec![0.0; 32], 44_100),
        )
    }

    #[test]
    fn test_second_analyze_is_cache_hit() {
        let (service, runs) = service();
        let progress_calls = Arc::new(AtomicUsize::new(0));
        let callback: ProgressCallback = {
            let calls = Arc::clone(&progress_calls);
            Arc::new(move |_: Progress| {
                calls.fetch_add(1, Ordering::SeqCst);
            })
        };

        let first = service
            .analyze(request("track.wav", 1), AnalysisOptions::default(), Some(callback.clone()))
            .unwrap();
        let second = service
            .analyze(request("track.wav", 1), AnalysisOptions::default(), Some(callback))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(progress_calls.load(Ordering::SeqCst), 1);
        assert_eq!(service.pool().stats().completed, 1);
    }

    #[test]
    fn test_cache_hit_skips_pool_initialization() {
        let (service, runs) = service();
        let key = fingerprint(&FileIdentity::new("known.wav", 1024, 5));
        service.cache().put(&key, &AnalysisResult::new(128.0, "Am"));

        let result = service
            .analyze(request("known.wav", 5), AnalysisOptions::default(), None)
            .unwrap();
        assert_eq!(result.bpm, 128.0);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(!service.pool().is_initialized());
    }

    #[test]
    fn test_modified_file_is_reanalyzed() {
        let (service, runs) = service();
        service.analyze(request("edit.wav", 1), AnalysisOptions::default(), None).unwrap();
        service.analyze(request("edit.wav", 2), AnalysisOptions::default(), None).unwrap();
        assert_eq!(runs.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failures_are_not_cached() {
        let (service, runs) = service();
        for _ in 0..2 {
            let outcome = service.analyze(request("fail", 1), AnalysisOptions::default(), None);
            assert!(matches!(outcome, Err(AnalysisError::Analyzer(_))));
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(service.cache().memory_len(), 0);
        assert_eq!(service.cache().persistent_len(), 0);
    }

    #[test]
    fn test_invalid_result_is_not_cached() {
        let (service, _runs) = service();
        let outcome = service.analyze(request("zero", 1), AnalysisOptions::default(), None);
        assert!(matches!(outcome, Err(AnalysisError::InvalidResult(_))));
        assert_eq!(service.cache().memory_len(), 0);
    }

    #[test]
    fn test_batch_preserves_order_and_isolates_failures() {
        let (service, runs) = service();
        let key = fingerprint(&FileIdentity::new("cached.wav", 1024, 1));
        service.cache().put(&key, &AnalysisResult::new(90.0, "C"));

        let results = service.analyze_batch(
            vec![
                request("a.wav", 1),
                request("fail", 1),
                request("cached.wav", 1),
                request("longer.wav", 1),
            ],
            AnalysisOptions::default(),
        );

        assert_eq!(results.len(), 4);
        assert_eq!(results[0].as_ref().unwrap().bpm, 105.0);
        assert!(matches!(results[1], Err(AnalysisError::Analyzer(_))));
        assert_eq!(results[2].as_ref().unwrap().bpm, 90.0);
        assert_eq!(results[3].as_ref().unwrap().bpm, 110.0);
        assert_eq!(runs.load(Ordering::SeqCst), 3);
        // Two successes plus the pre-seeded entry
        assert_eq!(service.cache().persistent_len(), 3);
    }

    #[test]
    fn test_results_survive_across_services() {
        let store = Arc::new(CozoStore::in_memory().unwrap());

        let (first, first_runs) = service_with_store(Arc::clone(&store));
        first.analyze(request("set.wav", 7), AnalysisOptions::default(), None).unwrap();
        first.shutdown();
        assert_eq!(first_runs.load(Ordering::SeqCst), 1);

        let (second, second_runs) = service_with_store(store);
        let result = second.analyze(request("set.wav", 7), AnalysisOptions::default(), None).unwrap();
        assert_eq!(result.bpm, 107.0);
        assert_eq!(second_runs.load(Ordering::SeqCst), 0);
    }
}
