//! Bucket stored as a plain directory tree
//!
//! Useful for a mounted network share or a local mirror of a bucket. Object
//! writes are atomic so concurrent readers never see partial objects.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::debug;

use super::{Backend, StorageError, StorageResult};
use crate::ratelimit::{RateLimiter, maybe_throttle};
use emu_sync_fs::{io as fs_io, key_to_path, validate_key};

/// Backend rooted at a local directory
#[derive(Debug, Clone)]
pub struct DirectoryBackend {
    root: PathBuf,
    prefix: Option<String>,
    limiter: Option<Arc<RateLimiter>>,
}

impl DirectoryBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            prefix: None,
            limiter: None,
        }
    }

    /// Store every object below `prefix` within the root.
    ///
    /// Leading and trailing slashes are ignored; an empty prefix means none.
    pub fn with_prefix(mut self, prefix: impl AsRef<str>) -> Self {
        let trimmed = prefix.as_ref().trim_matches('/');
        self.prefix = (!trimmed.is_empty()).then(|| trimmed.to_string());
        self
    }

    /// Charge every file transfer against `limiter`
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> StorageResult<PathBuf> {
        validate_key(key)?;
        let full_key = match &self.prefix {
            Some(prefix) => format!("{prefix}/{key}"),
            None => key.to_string(),
        };
        Ok(key_to_path(&self.root, &full_key))
    }

    fn open_object(&self, operation: &'static str, key: &str) -> StorageResult<File> {
        let path = self.object_path(key)?;
        File::open(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                StorageError::not_found(key)
            } else {
                StorageError::io(operation, key, e)
            }
        })
    }
}

impl Backend for DirectoryBackend {
    fn ping(&self) -> StorageResult<()> {
        match fs::metadata(&self.root) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(StorageError::Unavailable {
                message: format!("{} is not a directory", self.root.display()),
            }),
            Err(e) => Err(StorageError::Unavailable {
                message: format!("{}: {e}", self.root.display()),
            }),
        }
    }

    fn upload_file(&self, key: &str, local_path: &Path) -> StorageResult<()> {
        let dest = self.object_path(key)?;
        let source = File::open(local_path).map_err(|e| StorageError::io("upload", key, e))?;
        let written =
            fs_io::write_atomic_from(&dest, maybe_throttle(source, self.limiter.as_ref()))?;
        debug!(key, bytes = written, "stored object");
        Ok(())
    }

    fn upload_bytes(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let dest = self.object_path(key)?;
        fs_io::write_atomic(&dest, data)?;
        Ok(())
    }

    fn download_file(&self, key: &str, local_path: &Path) -> StorageResult<()> {
        let source = self.open_object("download", key)?;
        fs_io::stream_to(local_path, maybe_throttle(source, self.limiter.as_ref()))?;
        Ok(())
    }

    fn download_bytes(&self, key: &str) -> StorageResult<Vec<u8>> {
        let mut source = self.open_object("download", key)?;
        let mut data = Vec::new();
        io::Read::read_to_end(&mut source, &mut data)
            .map_err(|e| StorageError::io("download", key, e))?;
        Ok(data)
    }

    fn delete_object(&self, key: &str) -> StorageResult<()> {
        let path = self.object_path(key)?;
        // Deleting an absent object succeeds, as on S3
        fs_io::remove_if_exists(&path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MANIFEST_KEY;

    #[test]
    fn objects_round_trip_under_prefix() {
        let bucket = tempfile::tempdir().unwrap();
        let scratch = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new(bucket.path()).with_prefix("/emulation/");

        let src = scratch.path().join("Game.sfc");
        fs::write(&src, "snes rom data").unwrap();
        backend.upload_file("roms/snes/Game.sfc", &src).unwrap();

        assert!(bucket
            .path()
            .join("emulation/roms/snes/Game.sfc")
            .exists());

        let dest = scratch.path().join("copy.sfc");
        backend.download_file("roms/snes/Game.sfc", &dest).unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "snes rom data");
    }

    #[test]
    fn missing_manifest_is_not_found() {
        let bucket = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new(bucket.path());
        assert!(backend.download_manifest().unwrap_err().is_not_found());

        backend.upload_manifest(b"{}").unwrap();
        assert!(bucket.path().join(MANIFEST_KEY).exists());
    }

    #[test]
    fn delete_is_idempotent() {
        let bucket = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new(bucket.path());
        backend.upload_bytes("bios/a.bin", b"x").unwrap();
        backend.delete_object("bios/a.bin").unwrap();
        backend.delete_object("bios/a.bin").unwrap();
        assert!(!bucket.path().join("bios/a.bin").exists());
    }

    #[test]
    fn escaping_keys_are_rejected() {
        let bucket = tempfile::tempdir().unwrap();
        let backend = DirectoryBackend::new(bucket.path());
        assert!(backend.upload_bytes("../escape", b"x").is_err());
    }

    #[test]
    fn ping_requires_directory() {
        let bucket = tempfile::tempdir().unwrap();
        assert!(DirectoryBackend::new(bucket.path()).ping().is_ok());
        assert!(DirectoryBackend::new(bucket.path().join("absent")).ping().is_err());
    }
}
