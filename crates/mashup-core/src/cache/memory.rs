//! Bounded in-process cache tier
//!
//! Evicts in insertion order once the entry limit is exceeded. Re-inserting
//! a fingerprint counts as a fresh insertion.

use super::CacheEntry;
use std::collections::{BTreeMap, HashMap};

pub struct MemoryTier {
    capacity: usize,
    entries: HashMap<String, (u64, CacheEntry)>,
    /// Insertion sequence -> fingerprint, oldest first
    order: BTreeMap<u64, String>,
    next_seq: u64,
}

impl MemoryTier {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_seq: 0,
        }
    }

    pub fn get(&self, fingerprint: &str) -> Option<&CacheEntry> {
        self.entries.get(fingerprint).map(|(_, entry)| entry)
    }

    /// Insert an entry, returning the fingerprints evicted to make room
    pub fn insert(&mut self, entry: CacheEntry) -> Vec<String> {
        if let Some((seq, _)) = self.entries.remove(&entry.fingerprint) {
            self.order.remove(&seq);
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.order.insert(seq, entry.fingerprint.clone());
        self.entries.insert(entry.fingerprint.clone(), (seq, entry));

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some((_, oldest)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
            evicted.push(oldest);
        }
        evicted
    }

    pub fn remove(&mut self, fingerprint: &str) -> Option<CacheEntry> {
        let (seq, entry) = self.entries.remove(fingerprint)?;
        self.order.remove(&seq);
        Some(entry)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnalysisResult;

    fn entry(fp: &str, bpm: f64) -> CacheEntry {
        CacheEntry {
            fingerprint: fp.to_string(),
            result: AnalysisResult::new(bpm, "Am"),
            cached_at: 0,
        }
    }

    #[test]
    fn test_evicts_oldest_inserted() {
        let mut tier = MemoryTier::new(2);
        assert!(tier.insert(entry("a", 120.0)).is_empty());
        assert!(tier.insert(entry("b", 121.0)).is_empty());

        let evicted = tier.insert(entry("c", 122.0));
        assert_eq!(evicted, vec!["a".to_string()]);
        assert!(tier.get("a").is_none());
        assert!(tier.get("b").is_some());
        assert!(tier.get("c").is_some());
        assert_eq!(tier.len(), 2);
    }

    #[test]
    fn test_reinsert_refreshes_position() {
        let mut tier = MemoryTier::new(2);
        tier.insert(entry("a", 120.0));
        tier.insert(entry("b", 121.0));
        tier.insert(entry("a", 125.0));

        let evicted = tier.insert(entry("c", 122.0));
        assert_eq!(evicted, vec!["b".to_string()]);
        assert_eq!(tier.get("a").unwrap().result.bpm, 125.0);
    }

    #[test]
    fn test_remove_and_clear() {
        let mut tier = MemoryTier::new(4);
        tier.insert(entry("a", 120.0));
        tier.insert(entry("b", 121.0));

        assert!(tier.remove("a").is_some());
        assert!(tier.remove("a").is_none());
        assert_eq!(tier.len(), 1);

        tier.clear();
        assert!(tier.is_empty());
        // Order index is cleared too, so eviction starts fresh
        tier.insert(entry("x", 100.0));
        assert_eq!(tier.len(), 1);
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let tier = MemoryTier::new(0);
        assert_eq!(tier.capacity(), 1);
    }
}
