//! Cache keys derived from file identity
//!
//! A fingerprint is built from the file name, size and modification time,
//! the same metadata the collection uses to decide whether a track needs
//! re-analysis. File contents are never read.
//!
//! Two files with different bytes but identical name, size and mtime map
//! to the same fingerprint and therefore share a cache entry. That is an
//! accepted approximation for a single-user local library.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

/// Identity metadata of an analyzed file
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileIdentity {
    /// File name without directory
    pub name: String,
    /// Size in bytes
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch
    pub modified_ms: i64,
}

impl FileIdentity {
    pub fn new(name: impl Into<String>, size: u64, modified_ms: i64) -> Self {
        Self {
            name: name.into(),
            size,
            modified_ms,
        }
    }

    /// Read identity metadata from the filesystem
    pub fn from_path(path: &Path) -> io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| path.to_string_lossy().to_string());

        Ok(Self {
            name,
            size: meta.len(),
            modified_ms: meta.modified().map(system_time_to_ms).unwrap_or(0),
        })
    }
}

fn system_time_to_ms(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

/// Derive the cache key for a file
///
/// Format is `name:size:mtime`. Size and mtime never contain `:`, so the
/// key stays unambiguous when read from the right even if the name does.
pub fn fingerprint(identity: &FileIdentity) -> String {
    format!("{}:{}:{}", identity.name, identity.size, identity.modified_ms)
}
