//! [`TestTree`] fixture for upload and sync scenarios.

use std::fs;
use std::path::{Path, PathBuf};

use emu_sync_fs::key_to_path;
use filetime::FileTime;
use tempfile::TempDir;

/// A temporary directory laid out as
///
/// ```text
/// <tmp>/emu     the tree being uploaded or synced into
/// <tmp>/state   local manifest, hash cache, lock file
/// <tmp>/bucket  backing directory for a filesystem bucket
/// ```
///
/// # Example
///
/// ```rust,no_run
/// use emu_sync_test_utils::TestTree;
///
/// let tree = TestTree::new();
/// tree.write_file("roms/snes/Game.sfc", b"snes rom data");
/// tree.set_mtime("roms/snes/Game.sfc", 1_700_000_000);
/// tree.assert_file_contents("roms/snes/Game.sfc", b"snes rom data");
/// ```
pub struct TestTree {
    temp_dir: TempDir,
}

impl Default for TestTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TestTree {
    /// Create the temporary layout; `emu`, `state` and `bucket` start empty.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().unwrap();
        for dir in ["emu", "state", "bucket"] {
            fs::create_dir_all(temp_dir.path().join(dir)).unwrap();
        }
        Self { temp_dir }
    }

    /// The sync root
    pub fn root(&self) -> PathBuf {
        self.temp_dir.path().join("emu")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.temp_dir.path().join("state")
    }

    pub fn bucket_dir(&self) -> PathBuf {
        self.temp_dir.path().join("bucket")
    }

    pub fn local_manifest_path(&self) -> PathBuf {
        self.state_dir().join("local-manifest.json")
    }

    pub fn cache_path(&self) -> PathBuf {
        self.state_dir().join("upload-cache.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("sync.lock")
    }

    /// Native path of `key` under the sync root
    pub fn path(&self, key: &str) -> PathBuf {
        key_to_path(&self.root(), key)
    }

    /// Write `data` at `key`, creating parent directories.
    pub fn write_file(&self, key: &str, data: &[u8]) -> PathBuf {
        let path = self.path(key);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, data).unwrap();
        path
    }

    /// Pin the modification time of `key` to `unix_secs`.
    pub fn set_mtime(&self, key: &str, unix_secs: i64) {
        let time = FileTime::from_unix_time(unix_secs, 0);
        filetime::set_file_mtime(self.path(key), time).unwrap();
    }

    pub fn read(&self, key: &str) -> Vec<u8> {
        fs::read(self.path(key))
            .unwrap_or_else(|e| panic!("Could not read {}: {e}", self.path(key).display()))
    }

    pub fn remove(&self, key: &str) {
        fs::remove_file(self.path(key)).unwrap();
    }

    /// Every regular file under `dir`, as paths relative to it, sorted.
    pub fn list_files(dir: &Path) -> Vec<String> {
        let mut out = Vec::new();
        collect(dir, dir, &mut out);
        out.sort();
        out
    }

    /// Assert that `key` exists under the sync root.
    ///
    /// # Panics
    /// Panics with a descriptive message if it does not.
    pub fn assert_file_exists(&self, key: &str) {
        let path = self.path(key);
        assert!(path.exists(), "Expected file to exist: {}", path.display());
    }

    /// Assert that `key` does **not** exist under the sync root.
    ///
    /// # Panics
    /// Panics with a descriptive message if it does.
    pub fn assert_file_not_exists(&self, key: &str) {
        let path = self.path(key);
        assert!(
            !path.exists(),
            "Expected file NOT to exist: {}",
            path.display()
        );
    }

    /// Assert that `key` holds exactly `expected`.
    pub fn assert_file_contents(&self, key: &str, expected: &[u8]) {
        let actual = self.read(key);
        assert!(
            actual == expected,
            "Content mismatch for {key}: expected {} bytes, got {} bytes",
            expected.len(),
            actual.len()
        );
    }
}

fn collect(base: &Path, dir: &Path, out: &mut Vec<String>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            collect(base, &path, out);
        } else if let Ok(rel) = path.strip_prefix(base) {
            let parts: Vec<_> = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect();
            out.push(parts.join("/"));
        }
    }
}
