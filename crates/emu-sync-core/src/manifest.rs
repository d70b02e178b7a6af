//! Manifest model and diff
//!
//! A manifest maps object keys to `(size, content hash)`. Two manifests are
//! compared with [`diff`] to decide which files must move; manifests are
//! replaced wholesale and never patched on the remote side.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::{Error, Result};
use emu_sync_fs::{io, validate_key};

/// Current manifest format version
pub const MANIFEST_VERSION: u32 = 1;

/// Size and content hash of one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// File length in bytes
    pub size: i64,
    /// Hex MD5 of the file bytes
    #[serde(rename = "md5")]
    pub content_hash: String,
}

impl FileEntry {
    pub fn new(size: i64, content_hash: impl Into<String>) -> Self {
        Self {
            size,
            content_hash: content_hash.into(),
        }
    }
}

/// Snapshot of a file tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version for forward compatibility
    #[serde(default = "default_version")]
    pub version: u32,
    /// When this snapshot was produced; absent in JSON means the Unix epoch
    #[serde(default)]
    pub generated_at: DateTime<Utc>,
    /// Object key -> entry; absent or null in JSON means no files
    #[serde(default, deserialize_with = "null_as_empty")]
    pub files: BTreeMap<String, FileEntry>,
}

fn default_version() -> u32 {
    MANIFEST_VERSION
}

fn null_as_empty<'de, D>(
    deserializer: D,
) -> std::result::Result<BTreeMap<String, FileEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<BTreeMap<String, FileEntry>>::deserialize(deserializer)?.unwrap_or_default())
}

impl Default for Manifest {
    fn default() -> Self {
        Self::new()
    }
}

/// Keys that differ between two manifests, each list sorted
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    /// Present in the target, absent from the current state
    pub added: Vec<String>,
    /// Present in both with a different entry
    pub modified: Vec<String>,
    /// Present in the current state, absent from the target
    pub deleted: Vec<String>,
}

impl DiffResult {
    /// True when the two manifests agree on every key
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }

    /// Keys whose content must be transferred: added, then modified
    pub fn transfer_keys(&self) -> Vec<String> {
        self.added.iter().chain(&self.modified).cloned().collect()
    }
}

impl Manifest {
    /// Create an empty manifest stamped with the current time
    pub fn new() -> Self {
        Self {
            version: MANIFEST_VERSION,
            generated_at: Utc::now(),
            files: BTreeMap::new(),
        }
    }

    /// Parse a manifest from JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the JSON is malformed or any key is not a
    /// normalized object key.
    pub fn parse_json(data: &[u8]) -> Result<Self> {
        let manifest: Manifest =
            serde_json::from_slice(data).map_err(|source| Error::ManifestParse { source })?;
        for key in manifest.files.keys() {
            validate_key(key)?;
        }
        Ok(manifest)
    }

    /// Serialize to pretty-printed JSON
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    /// Load a manifest from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed. Callers that
    /// treat a missing file as "first run" check [`emu_sync_fs::Error::is_not_found`].
    pub fn load_from_disk(path: &Path) -> Result<Self> {
        let data = io::read_bytes(path)?;
        Self::parse_json(&data)
    }

    /// Save to disk atomically, creating parent directories as needed.
    pub fn save_to_disk(&self, path: &Path) -> Result<()> {
        let data = self.to_json()?;
        io::write_atomic(path, &data)?;
        Ok(())
    }

    /// Number of files described
    pub fn len(&self) -> usize {
        self.files.len()
    }

    /// True when no files are described
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&FileEntry> {
        self.files.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.files.contains_key(key)
    }

    /// Insert or replace the entry for `key`
    pub fn insert(&mut self, key: impl Into<String>, entry: FileEntry) {
        self.files.insert(key.into(), entry);
    }

    /// Remove the entry for `key`, returning it if present
    pub fn remove(&mut self, key: &str) -> Option<FileEntry> {
        self.files.remove(key)
    }

    /// A copy holding only the keys `keep` accepts
    pub fn filtered(&self, keep: impl Fn(&str) -> bool) -> Self {
        Self {
            version: self.version,
            generated_at: self.generated_at,
            files: self
                .files
                .iter()
                .filter(|(key, _)| keep(key))
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect(),
        }
    }
}

/// Compute what `current` must do to become `target`.
///
/// Pure: neither input is modified.
pub fn diff(target: &Manifest, current: &Manifest) -> DiffResult {
    let mut result = DiffResult::default();

    for (key, entry) in &target.files {
        match current.files.get(key) {
            None => result.added.push(key.clone()),
            Some(existing) if existing != entry => result.modified.push(key.clone()),
            Some(_) => {}
        }
    }

    result.deleted = current
        .files
        .keys()
        .filter(|key| !target.files.contains_key(*key))
        .cloned()
        .collect();

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest(entries: &[(&str, i64, &str)]) -> Manifest {
        let mut m = Manifest::new();
        for (key, size, hash) in entries {
            m.insert(*key, FileEntry::new(*size, *hash));
        }
        m
    }

    #[test]
    fn new_manifest_is_empty_version_one() {
        let m = Manifest::new();
        assert_eq!(m.version, 1);
        assert!(m.is_empty());
    }

    #[test]
    fn diff_classifies_keys() {
        let remote = manifest(&[
            ("roms/a.bin", 1, "aaa"),
            ("roms/b.bin", 2, "bbb"),
            ("roms/c.bin", 3, "ccc"),
        ]);
        let local = manifest(&[
            ("roms/b.bin", 2, "bbb"),
            ("roms/c.bin", 3, "old"),
            ("roms/d.bin", 4, "ddd"),
        ]);

        let d = diff(&remote, &local);

        assert_eq!(d.added, vec!["roms/a.bin"]);
        assert_eq!(d.modified, vec!["roms/c.bin"]);
        assert_eq!(d.deleted, vec!["roms/d.bin"]);
        assert_eq!(d.transfer_keys(), vec!["roms/a.bin", "roms/c.bin"]);
    }

    #[test]
    fn size_change_alone_is_a_modification() {
        let remote = manifest(&[("bios/x.bin", 10, "same")]);
        let local = manifest(&[("bios/x.bin", 11, "same")]);
        assert_eq!(diff(&remote, &local).modified, vec!["bios/x.bin"]);
    }

    #[test]
    fn diff_does_not_mutate_inputs() {
        let remote = manifest(&[("a", 1, "x")]);
        let local = manifest(&[("b", 1, "y")]);
        let (r, l) = (remote.clone(), local.clone());
        let _ = diff(&remote, &local);
        assert_eq!(remote, r);
        assert_eq!(local, l);
    }

    #[test]
    fn missing_files_field_parses_as_empty() {
        let m = Manifest::parse_json(br#"{"version":1,"generated_at":"2024-01-01T00:00:00Z"}"#)
            .unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn null_files_field_parses_as_empty() {
        let m = Manifest::parse_json(
            br#"{"version":1,"generated_at":"2024-01-01T00:00:00Z","files":null}"#,
        )
        .unwrap();
        assert!(m.is_empty());
    }

    #[test]
    fn files_alone_take_default_header() {
        let m = Manifest::parse_json(br#"{"files":{"roms/a.sfc":{"size":3,"md5":"abc"}}}"#)
            .unwrap();
        assert_eq!(m.version, MANIFEST_VERSION);
        assert_eq!(m.generated_at.timestamp(), 0);
        assert_eq!(m.get("roms/a.sfc"), Some(&FileEntry::new(3, "abc")));
    }

    #[test]
    fn wire_format_uses_md5_field() {
        let m = manifest(&[("roms/snes/Game.sfc", 13, "abc")]);
        let json: serde_json::Value = serde_json::from_slice(&m.to_json().unwrap()).unwrap();
        assert_eq!(json["version"], 1);
        assert_eq!(json["files"]["roms/snes/Game.sfc"]["size"], 13);
        assert_eq!(json["files"]["roms/snes/Game.sfc"]["md5"], "abc");
        assert!(json["generated_at"].is_string());
    }

    #[test]
    fn parse_rejects_escaping_keys() {
        let data = br#"{"version":1,"generated_at":"2024-01-01T00:00:00Z",
            "files":{"../outside":{"size":1,"md5":"x"}}}"#;
        assert!(Manifest::parse_json(data).is_err());
    }

    #[test]
    fn filtered_keeps_selected_keys() {
        let m = manifest(&[("roms/a", 1, "x"), ("bios/b", 2, "y")]);
        let f = m.filtered(|k| k.starts_with("roms/"));
        assert_eq!(f.len(), 1);
        assert!(f.contains("roms/a"));
        assert_eq!(f.generated_at, m.generated_at);
    }
}
