//! Upload-side hash cache
//!
//! Memoizes `(key, size, mtime) -> content hash` so unchanged files are not
//! re-hashed on every upload. The cache is advisory: a missing or corrupt
//! cache file degrades to "rehash everything", never to an error.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::Result;
use emu_sync_fs::io;

/// Cached hash for one file, valid while size and mtime are unchanged
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub size: i64,
    pub mtime: DateTime<Utc>,
    #[serde(rename = "md5")]
    pub content_hash: String,
}

/// Persisted map of object key -> [`CacheEntry`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashCache {
    #[serde(default)]
    files: BTreeMap<String, CacheEntry>,
}

impl HashCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the cache from disk, or start empty if it is missing or corrupt.
    pub fn load(path: &Path) -> Self {
        let data = match io::read_bytes(path) {
            Ok(data) => data,
            Err(e) if e.is_not_found() => {
                debug!(path = %path.display(), "no upload cache yet");
                return Self::new();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable upload cache, rebuilding");
                return Self::new();
            }
        };

        match serde_json::from_slice(&data) {
            Ok(cache) => cache,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "corrupt upload cache, rebuilding");
                Self::new()
            }
        }
    }

    /// Save the cache atomically, creating parent directories as needed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        io::write_atomic(path, &data)?;
        Ok(())
    }

    /// Cached hash for `key`, if size and mtime both still match.
    pub fn lookup(&self, key: &str, size: i64, mtime: DateTime<Utc>) -> Option<&str> {
        self.files
            .get(key)
            .filter(|entry| entry.size == size && entry.mtime == mtime)
            .map(|entry| entry.content_hash.as_str())
    }

    /// Insert or replace the entry for `key`
    pub fn update(
        &mut self,
        key: impl Into<String>,
        size: i64,
        mtime: DateTime<Utc>,
        content_hash: impl Into<String>,
    ) {
        self.files.insert(
            key.into(),
            CacheEntry {
                size,
                mtime,
                content_hash: content_hash.into(),
            },
        );
    }

    /// Drop every entry whose key is not in `valid`
    pub fn prune(&mut self, valid: &HashSet<&str>) {
        self.files.retain(|key, _| valid.contains(key.as_str()));
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
