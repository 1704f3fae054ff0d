//! Two-tier analysis result cache
//!
//! A bounded in-process map sits in front of a persistent key-value store.
//! Both tiers are validated on read: an entry that fails structural checks
//! or is older than the configured max age is treated as absent and purged.
//!
//! The persistent tier is best-effort. Its errors are logged and swallowed,
//! so an unavailable disk only costs recomputation.
//!
//! ```ignore
//! let cache = ResultCache::open(&CacheConfig::default());
//! if let Some(hit) = cache.get(&fp) {
//!     return Ok(hit);
//! }
//! cache.put(&fp, &fresh_result);
//! ```

mod memory;
pub mod store;
pub mod validate;

pub use memory::MemoryTier;
pub use store::{CozoStore, PersistentStore, StoreError, StoredEntry};
pub use validate::{is_expired, parse_stored, validate_result};

use crate::config::CacheConfig;
use crate::types::AnalysisResult;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// A validated result with its fingerprint and cache time
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub result: AnalysisResult,
    /// Milliseconds since the Unix epoch
    pub cached_at: i64,
}

/// Memory tier backed by an optional persistent tier
pub struct ResultCache {
    memory: Mutex<MemoryTier>,
    store: Option<Arc<dyn PersistentStore>>,
    max_age: Duration,
}

impl ResultCache {
    /// Create a cache over an explicit persistent store
    pub fn new(memory_capacity: usize, max_age: Duration, store: Arc<dyn PersistentStore>) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::new(memory_capacity)),
            store: Some(store),
            max_age,
        }
    }

    /// Create a cache without a persistent tier
    pub fn memory_only(memory_capacity: usize, max_age: Duration) -> Self {
        Self {
            memory: Mutex::new(MemoryTier::new(memory_capacity)),
            store: None,
            max_age,
        }
    }

    /// Build the cache described by the configuration
    ///
    /// If the persistent store cannot be opened the cache degrades to
    /// memory-only rather than failing.
    pub fn open(config: &CacheConfig) -> Self {
        let max_age = config.max_age();
        if !config.persistent {
            return Self::memory_only(config.memory_capacity, max_age);
        }

        let path = config.resolved_store_path();
        match CozoStore::open(&path) {
            Ok(store) => Self::new(config.memory_capacity, max_age, Arc::new(store)),
            Err(e) => {
                log::warn!("Result cache: persistent tier unavailable ({}), using memory only", e);
                Self::memory_only(config.memory_capacity, max_age)
            }
        }
    }

    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    fn memory(&self) -> MutexGuard<'_, MemoryTier> {
        // A poisoned lock only means another thread panicked mid-update;
        // the map itself is still structurally sound.
        self.memory.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Look up a fingerprint, memory tier first
    pub fn get(&self, fingerprint: &str) -> Option<AnalysisResult> {
        let now = now_ms();

        {
            let mut memory = self.memory();
            if let Some(entry) = memory.get(fingerprint) {
                let problem = match validate_result(&entry.result) {
                    Err(e) => Some(e),
                    Ok(()) if is_expired(entry.cached_at, now, self.max_age) => Some("expired".to_string()),
                    Ok(()) => None,
                };
                match problem {
                    None => {
                        log::debug!("Result cache: memory hit for {}", fingerprint);
                        return Some(entry.result.clone());
                    }
                    Some(reason) => {
                        log::debug!("Result cache: evicting {} from memory ({})", fingerprint, reason);
                        memory.remove(fingerprint);
                        return None;
                    }
                }
            }
        }

        let store = self.store.as_ref()?;
        let stored = match store.get(fingerprint) {
            Ok(Some(stored)) => stored,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Result cache: persistent read failed for {}: {}", fingerprint, e);
                return None;
            }
        };

        let parsed = if is_expired(stored.cached_at, now, self.max_age) {
            Err("expired".to_string())
        } else {
            parse_stored(&stored.result)
        };

        match parsed {
            Ok(result) => {
                log::debug!("Result cache: persistent hit for {}, promoting", fingerprint);
                self.memory().insert(CacheEntry {
                    fingerprint: fingerprint.to_string(),
                    result: result.clone(),
                    cached_at: stored.cached_at,
                });
                Some(result)
            }
            Err(reason) => {
                log::info!("Result cache: discarding stored entry {} ({})", fingerprint, reason);
                if let Err(e) = store.delete(fingerprint) {
                    log::warn!("Result cache: failed to purge {}: {}", fingerprint, e);
                }
                None
            }
        }
    }

    /// Store a result in both tiers
    ///
    /// Returns false (and stores nothing) if the result would fail
    /// validation on the way back out.
    pub fn put(&self, fingerprint: &str, result: &AnalysisResult) -> bool {
        if let Err(reason) = validate_result(result) {
            log::warn!("Result cache: refusing to store {} ({})", fingerprint, reason);
            return false;
        }

        let cached_at = now_ms();
        let evicted = self.memory().insert(CacheEntry {
            fingerprint: fingerprint.to_string(),
            result: result.clone(),
            cached_at,
        });
        if !evicted.is_empty() {
            log::debug!("Result cache: evicted {} memory entries", evicted.len());
        }

        if let Some(store) = &self.store {
            let write = serde_json::to_value(result)
                .map_err(|e| StoreError::Serialization(e.to_string()))
                .and_then(|value| store.put(fingerprint, &StoredEntry { result: value, cached_at }));
            if let Err(e) = write {
                log::warn!("Result cache: persistent write failed for {}: {}", fingerprint, e);
            }
        }
        true
    }

    /// Empty both tiers
    pub fn clear(&self) {
        self.memory().clear();
        if let Some(store) = &self.store {
            if let Err(e) = store.clear() {
                log::warn!("Result cache: failed to clear persistent tier: {}", e);
            }
        }
        log::info!("Result cache cleared");
    }

    /// Remove persistent entries older than `max_age`, returning how many
    pub fn purge_older_than(&self, max_age: Duration) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let cutoff = now_ms().saturating_sub(max_age.as_millis() as i64);
        match store.purge_older_than(cutoff) {
            Ok(count) => count,
            Err(e) => {
                log::warn!("Result cache: purge failed: {}", e);
                0
            }
        }
    }

    pub fn memory_len(&self) -> usize {
        self.memory().len()
    }

    /// Entries in the persistent tier (0 when there is none or it fails)
    pub fn persistent_len(&self) -> usize {
        self.store
            .as_ref()
            .and_then(|store| store.len().ok())
            .unwrap_or(0)
    }

    #[cfg(test)]
    fn insert_memory_entry(&self, entry: CacheEntry) {
        self.memory().insert(entry);
    }
}

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const DAY_MS: i64 = 24 * 60 * 60 * 1000;
    const THIRTY_DAYS: Duration = Duration::from_secs(30 * 24 * 60 * 60);

    fn cache_with_store() -> (ResultCache, Arc<CozoStore>) {
        let store = Arc::new(CozoStore::in_memory().unwrap());
        let cache = ResultCache::new(8, THIRTY_DAYS, store.clone());
        (cache, store)
    }

    /// Store that fails every operation
    struct BrokenStore;

    impl PersistentStore for BrokenStore {
        fn get(&self, _: &str) -> Result<Option<StoredEntry>, StoreError> {
            Err(StoreError::Query("disk gone".into()))
        }
        fn put(&self, _: &str, _: &StoredEntry) -> Result<(), StoreError> {
            Err(StoreError::Query("disk gone".into()))
        }
        fn delete(&self, _: &str) -> Result<(), StoreError> {
            Err(StoreError::Query("disk gone".into()))
        }
        fn clear(&self) -> Result<(), StoreError> {
            Err(StoreError::Query("disk gone".into()))
        }
        fn purge_older_than(&self, _: i64) -> Result<usize, StoreError> {
            Err(StoreError::Query("disk gone".into()))
        }
        fn len(&self) -> Result<usize, StoreError> {
            Err(StoreError::Query("disk gone".into()))
        }
    }

    #[test]
    fn test_put_then_get_hits_memory() {
        let (cache, store) = cache_with_store();
        let result = AnalysisResult::new(128.0, "Am");

        assert!(cache.put("fp", &result));
        assert_eq!(cache.get("fp"), Some(result));
        assert_eq!(cache.memory_len(), 1);
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn test_clean_miss_has_no_side_effects() {
        let (cache, store) = cache_with_store();
        assert!(cache.get("nothing").is_none());
        assert_eq!(cache.memory_len(), 0);
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn test_put_rejects_zero_bpm() {
        let (cache, store) = cache_with_store();
        let bad = AnalysisResult::new(0.0, "Cmaj");

        assert!(!cache.put("fp", &bad));
        assert!(cache.get("fp").is_none());
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn test_persistent_hit_is_promoted() {
        let (cache, store) = cache_with_store();
        store
            .put("fp", &StoredEntry { result: json!({"bpm": 174.0, "key": "F#m"}), cached_at: now_ms() })
            .unwrap();

        assert_eq!(cache.memory_len(), 0);
        let hit = cache.get("fp").unwrap();
        assert_eq!(hit.bpm, 174.0);
        assert_eq!(hit.key, "F#m");
        assert_eq!(cache.memory_len(), 1);
    }

    #[test]
    fn test_invalid_bpm_never_returned_from_persistent_tier() {
        let (cache, store) = cache_with_store();
        let now = now_ms();
        let bad_values = [
            json!({"bpm": 0, "key": "Am"}),
            json!({"key": "Am"}),
            json!({"bpm": "fast", "key": "Am"}),
        ];

        for (i, value) in bad_values.into_iter().enumerate() {
            let fp = format!("bad-{}", i);
            store.put(&fp, &StoredEntry { result: value, cached_at: now }).unwrap();

            assert!(cache.get(&fp).is_none());
            // Not promoted, and purged from disk
            assert_eq!(cache.memory_len(), 0);
            assert!(store.get(&fp).unwrap().is_none());
        }
    }

    #[test]
    fn test_invalid_bpm_never_returned_from_memory_tier() {
        let (cache, _store) = cache_with_store();
        cache.insert_memory_entry(CacheEntry {
            fingerprint: "fp".to_string(),
            result: AnalysisResult::new(0.0, "Am"),
            cached_at: now_ms(),
        });

        assert!(cache.get("fp").is_none());
        assert_eq!(cache.memory_len(), 0);
    }

    #[test]
    fn test_expired_entries_are_absent() {
        let (cache, store) = cache_with_store();
        let old = now_ms() - 31 * DAY_MS;

        cache.insert_memory_entry(CacheEntry {
            fingerprint: "mem-old".to_string(),
            result: AnalysisResult::new(120.0, "C"),
            cached_at: old,
        });
        assert!(cache.get("mem-old").is_none());

        store
            .put("disk-old", &StoredEntry { result: json!({"bpm": 120.0, "key": "C"}), cached_at: old })
            .unwrap();
        assert!(cache.get("disk-old").is_none());
        assert_eq!(cache.memory_len(), 0);
    }

    #[test]
    fn test_purge_older_than_thirty_days() {
        let (cache, store) = cache_with_store();
        let now = now_ms();
        store
            .put("aged-31", &StoredEntry { result: json!({"bpm": 120.0, "key": "C"}), cached_at: now - 31 * DAY_MS })
            .unwrap();
        store
            .put("aged-1", &StoredEntry { result: json!({"bpm": 122.0, "key": "D"}), cached_at: now - DAY_MS })
            .unwrap();

        assert_eq!(cache.purge_older_than(THIRTY_DAYS), 1);
        assert!(store.get("aged-31").unwrap().is_none());
        assert!(store.get("aged-1").unwrap().is_some());
    }

    #[test]
    fn test_clear_empties_both_tiers() {
        let (cache, store) = cache_with_store();
        cache.put("a", &AnalysisResult::new(120.0, "C"));
        cache.put("b", &AnalysisResult::new(121.0, "D"));

        cache.clear();
        assert_eq!(cache.memory_len(), 0);
        assert_eq!(store.len().unwrap(), 0);
        assert!(cache.get("a").is_none());
    }

    #[test]
    fn test_memory_capacity_evicts_oldest() {
        let store = Arc::new(CozoStore::in_memory().unwrap());
        let cache = ResultCache::new(2, THIRTY_DAYS, store.clone());
        cache.put("a", &AnalysisResult::new(120.0, "C"));
        cache.put("b", &AnalysisResult::new(121.0, "D"));
        cache.put("c", &AnalysisResult::new(122.0, "E"));

        assert_eq!(cache.memory_len(), 2);
        // Evicted from memory, still served from disk
        assert_eq!(cache.get("a").unwrap().bpm, 120.0);
    }

    #[test]
    fn test_store_failures_are_swallowed() {
        let cache = ResultCache::new(4, THIRTY_DAYS, Arc::new(BrokenStore));
        let result = AnalysisResult::new(128.0, "Am");

        assert!(cache.put("fp", &result));
        assert_eq!(cache.get("fp"), Some(result));
        assert!(cache.get("other").is_none());
        assert_eq!(cache.purge_older_than(THIRTY_DAYS), 0);
        cache.clear();
        assert_eq!(cache.persistent_len(), 0);
    }

    #[test]
    fn test_memory_only_cache() {
        let cache = ResultCache::memory_only(4, THIRTY_DAYS);
        cache.put("fp", &AnalysisResult::new(100.0, "G"));
        assert!(cache.get("fp").is_some());
        assert_eq!(cache.purge_older_than(Duration::ZERO), 0);
    }
}
