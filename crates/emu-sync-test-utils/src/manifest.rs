//! Manifest JSON fixtures.

use std::fs;
use std::path::Path;

use emu_sync_fs::checksum::hash_bytes;
use serde_json::{Map, Value, json};

/// Builds manifest JSON in the published wire format.
///
/// ```rust,no_run
/// use emu_sync_test_utils::ManifestBuilder;
///
/// let json = ManifestBuilder::new()
///     .file("roms/snes/Game.sfc", b"snes rom data")
///     .entry("bios/scph1001.bin", 9999, "00000000000000000000000000000000")
///     .to_json();
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManifestBuilder {
    files: Map<String, Value>,
}

impl ManifestBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `key` with the size and MD5 of `data`
    pub fn file(self, key: &str, data: &[u8]) -> Self {
        let hash = hash_bytes(data);
        self.entry(key, data.len() as i64, &hash)
    }

    /// Add `key` with an explicit size and hash
    pub fn entry(mut self, key: &str, size: i64, md5: &str) -> Self {
        self.files
            .insert(key.to_string(), json!({ "size": size, "md5": md5 }));
        self
    }

    pub fn to_value(&self) -> Value {
        json!({
            "version": 1,
            "generated_at": "2024-01-01T00:00:00Z",
            "files": Value::Object(self.files.clone()),
        })
    }

    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec_pretty(&self.to_value()).unwrap()
    }

    /// Write the manifest to `path`, creating parent directories.
    pub fn write_to(&self, path: &Path) {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(path, self.to_json()).unwrap();
    }
}
