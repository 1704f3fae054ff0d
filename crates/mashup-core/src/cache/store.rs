//! Persistent cache tier backed by CozoDB
//!
//! Results are stored as JSON text in a single relation keyed by
//! fingerprint:
//!
//! ```text
//! analysis_cache { fingerprint: String => result: String, cached_at: Int }
//! ```
//!
//! The cache only depends on the [`PersistentStore`] trait, so any
//! key-value engine with get/put/delete/clear and an age sweep works.

use cozo::{DataValue, DbInstance, NamedRows, ScriptMutability};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

const RELATION: &str = "analysis_cache";

/// Persistent store errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Failed to open cache store: {0}")]
    Open(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// A raw persisted entry; `result` is validated by the cache, not the store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredEntry {
    pub result: Value,
    /// Milliseconds since the Unix epoch
    pub cached_at: i64,
}

/// Key-value operations the result cache needs from durable storage
pub trait PersistentStore: Send + Sync {
    fn get(&self, fingerprint: &str) -> Result<Option<StoredEntry>, StoreError>;

    fn put(&self, fingerprint: &str, entry: &StoredEntry) -> Result<(), StoreError>;

    fn delete(&self, fingerprint: &str) -> Result<(), StoreError>;

    fn clear(&self) -> Result<(), StoreError>;

    /// Remove entries cached strictly before `cutoff_ms`, returning how many
    fn purge_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError>;

    fn len(&self) -> Result<usize, StoreError>;
}

/// CozoDB implementation of the persistent tier
pub struct CozoStore {
    db: DbInstance,
}

impl CozoStore {
    /// Open or create a store at the given path (SQLite engine)
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Open(format!("Failed to create directory: {}", e)))?;
        }

        log::info!("Opening analysis cache at {:?}", path);
        let db = DbInstance::new("sqlite", path, "").map_err(|e| StoreError::Open(e.to_string()))?;

        let store = Self { db };
        store.ensure_schema()?;
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let db = DbInstance::new("mem", "", "").map_err(|e| StoreError::Open(e.to_string()))?;

        let store = Self { db };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<(), StoreError> {
        let existing = self.existing_relations()?;
        if existing.contains(RELATION) {
            return Ok(());
        }

        log::debug!("Creating '{}' relation", RELATION);
        self.db
            .run_script(
                r#"
                {:create analysis_cache {
                    fingerprint: String =>
                    result: String,
                    cached_at: Int
                }}
                "#,
                Default::default(),
                ScriptMutability::Mutable,
            )
            .map_err(|e| StoreError::Schema(e.to_string()))?;
        Ok(())
    }

    fn existing_relations(&self) -> Result<HashSet<String>, StoreError> {
        let result = self
            .db
            .run_script("::relations", Default::default(), ScriptMutability::Immutable)
            .map_err(|e| StoreError::Schema(e.to_string()))?;

        // Columns are [name, arity, access_level, ...]; only the name matters
        Ok(result
            .rows
            .iter()
            .filter_map(|row| row.first().and_then(|v| v.get_str()).map(|s| s.to_string()))
            .collect())
    }

    fn run_script(&self, script: &str, params: BTreeMap<String, DataValue>) -> Result<NamedRows, StoreError> {
        self.db
            .run_script(script, params, ScriptMutability::Mutable)
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    fn run_query(&self, script: &str, params: BTreeMap<String, DataValue>) -> Result<NamedRows, StoreError> {
        self.db
            .run_script(script, params, ScriptMutability::Immutable)
            .map_err(|e| StoreError::Query(e.to_string()))
    }

    fn count_rows(result: &NamedRows) -> usize {
        result
            .rows
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.get_int())
            .unwrap_or(0) as usize
    }
}

impl PersistentStore for CozoStore {
    fn get(&self, fingerprint: &str) -> Result<Option<StoredEntry>, StoreError> {
        let mut params = BTreeMap::new();
        params.insert("fingerprint".to_string(), DataValue::from(fingerprint));

        let result = self.run_query(
            r#"
            ?[result, cached_at] :=
                *analysis_cache{fingerprint, result, cached_at},
                fingerprint = $fingerprint
            "#,
            params,
        )?;

        let Some(row) = result.rows.first() else {
            return Ok(None);
        };

        let raw = row.first().and_then(|v| v.get_str()).unwrap_or_default();
        let cached_at = row.get(1).and_then(|v| v.get_int()).unwrap_or(0);

        // Unparseable text is surfaced as a bare string so validation rejects it
        let result = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));

        Ok(Some(StoredEntry { result, cached_at }))
    }

    fn put(&self, fingerprint: &str, entry: &StoredEntry) -> Result<(), StoreError> {
        let json = serde_json::to_string(&entry.result)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut params = BTreeMap::new();
        params.insert("fingerprint".to_string(), DataValue::from(fingerprint));
        params.insert("result".to_string(), DataValue::from(json));
        params.insert("cached_at".to_string(), DataValue::from(entry.cached_at));

        self.run_script(
            r#"
            ?[fingerprint, result, cached_at] <- [[$fingerprint, $result, $cached_at]]
            :put analysis_cache {fingerprint => result, cached_at}
            "#,
            params,
        )?;
        Ok(())
    }

    fn delete(&self, fingerprint: &str) -> Result<(), StoreError> {
        let mut params = BTreeMap::new();
        params.insert("fingerprint".to_string(), DataValue::from(fingerprint));

        self.run_script(
            r#"
            ?[fingerprint] <- [[$fingerprint]]
            :rm analysis_cache {fingerprint}
            "#,
            params,
        )?;
        Ok(())
    }

    fn clear(&self) -> Result<(), StoreError> {
        self.run_script(
            r#"
            ?[fingerprint] := *analysis_cache{fingerprint}
            :rm analysis_cache {fingerprint}
            "#,
            BTreeMap::new(),
        )?;
        Ok(())
    }

    fn purge_older_than(&self, cutoff_ms: i64) -> Result<usize, StoreError> {
        let mut params = BTreeMap::new();
        params.insert("cutoff".to_string(), DataValue::from(cutoff_ms));

        let stale = self.run_query(
            r#"
            ?[count(fingerprint)] :=
                *analysis_cache{fingerprint, cached_at},
                cached_at < $cutoff
            "#,
            params.clone(),
        )?;
        let count = Self::count_rows(&stale);
        if count == 0 {
            return Ok(0);
        }

        self.run_script(
            r#"
            ?[fingerprint] :=
                *analysis_cache{fingerprint, cached_at},
                cached_at < $cutoff
            :rm analysis_cache {fingerprint}
            "#,
            params,
        )?;

        log::info!("Purged {} cache entries older than {}", count, cutoff_ms);
        Ok(count)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let result = self.run_query(
            r#"
            ?[count(fingerprint)] := *analysis_cache{fingerprint}
            "#,
            BTreeMap::new(),
        )?;
        Ok(Self::count_rows(&result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(bpm: f64, cached_at: i64) -> StoredEntry {
        StoredEntry {
            result: json!({"bpm": bpm, "key": "Am"}),
            cached_at,
        }
    }

    #[test]
    fn test_put_get_delete() {
        let store = CozoStore::in_memory().unwrap();
        assert!(store.get("a").unwrap().is_none());

        store.put("a", &entry(128.0, 10)).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(entry(128.0, 10)));

        // Put overwrites
        store.put("a", &entry(130.0, 20)).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap().cached_at, 20);
        assert_eq!(store.len().unwrap(), 1);

        store.delete("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
    }

    #[test]
    fn test_clear() {
        let store = CozoStore::in_memory().unwrap();
        store.put("a", &entry(120.0, 1)).unwrap();
        store.put("b", &entry(121.0, 2)).unwrap();
        assert_eq!(store.len().unwrap(), 2);

        store.clear().unwrap();
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn test_purge_older_than() {
        let store = CozoStore::in_memory().unwrap();
        store.put("old", &entry(120.0, 100)).unwrap();
        store.put("edge", &entry(121.0, 200)).unwrap();
        store.put("new", &entry(122.0, 300)).unwrap();

        assert_eq!(store.purge_older_than(200).unwrap(), 1);
        assert!(store.get("old").unwrap().is_none());
        assert!(store.get("edge").unwrap().is_some());
        assert_eq!(store.purge_older_than(200).unwrap(), 0);
    }

    #[test]
    fn test_reopen_sqlite_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("analysis.db");

        {
            let store = CozoStore::open(&path).unwrap();
            store.put("persisted", &entry(126.0, 5)).unwrap();
        }

        let store = CozoStore::open(&path).unwrap();
        assert_eq!(store.get("persisted").unwrap(), Some(entry(126.0, 5)));
    }
}
