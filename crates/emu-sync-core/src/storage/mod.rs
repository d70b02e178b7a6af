//! Object-store backends
//!
//! The engines talk to the bucket only through [`Backend`]. A network client
//! for an S3-compatible service implements the same trait outside this
//! crate; [`DirectoryBackend`] and [`MemoryBackend`] ship here.

mod directory;
mod memory;

pub use directory::DirectoryBackend;
pub use memory::MemoryBackend;

use std::path::Path;

/// Well-known key of the published manifest within the bucket/prefix
pub const MANIFEST_KEY: &str = "emu-sync-manifest.json";

/// Result type for backend operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors reported by a storage backend
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The requested object does not exist
    #[error("object not found: {key}")]
    NotFound { key: String },

    /// The service rejected or failed the request
    #[error("{operation} {key} failed: {message}")]
    Remote {
        operation: &'static str,
        key: String,
        message: String,
    },

    /// Local or transport I/O failed mid-operation
    #[error("{operation} {key}: {source}")]
    Io {
        operation: &'static str,
        key: String,
        #[source]
        source: std::io::Error,
    },

    /// Credentials or bucket could not be verified
    #[error("bucket unavailable: {message}")]
    Unavailable { message: String },

    /// Filesystem error from emu-sync-fs
    #[error(transparent)]
    Fs(#[from] emu_sync_fs::Error),
}

impl StorageError {
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    pub fn io(operation: &'static str, key: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            operation,
            key: key.into(),
            source,
        }
    }

    /// True when the object simply does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            Self::Fs(e) => e.is_not_found(),
            _ => false,
        }
    }
}

/// Object-store operations needed by upload, sync and verify.
///
/// Implementations must be safe to call from several worker threads at once.
pub trait Backend: Send + Sync {
    /// Verify that credentials and bucket are usable
    fn ping(&self) -> StorageResult<()>;

    /// Upload the file at `local_path` as `key`
    fn upload_file(&self, key: &str, local_path: &Path) -> StorageResult<()>;

    /// Upload an in-memory buffer as `key`
    fn upload_bytes(&self, key: &str, data: &[u8]) -> StorageResult<()>;

    /// Download `key` into `local_path`, creating or truncating it.
    ///
    /// Not atomic: on failure `local_path` may hold partial content, so
    /// callers download into a temporary path and rename on success.
    fn download_file(&self, key: &str, local_path: &Path) -> StorageResult<()>;

    /// Download `key` into memory
    fn download_bytes(&self, key: &str) -> StorageResult<Vec<u8>>;

    /// Delete `key`
    fn delete_object(&self, key: &str) -> StorageResult<()>;

    /// Fetch the published manifest
    fn download_manifest(&self) -> StorageResult<Vec<u8>> {
        self.download_bytes(MANIFEST_KEY)
    }

    /// Publish a manifest, replacing the previous one
    fn upload_manifest(&self, data: &[u8]) -> StorageResult<()> {
        self.upload_bytes(MANIFEST_KEY, data)
    }
}
