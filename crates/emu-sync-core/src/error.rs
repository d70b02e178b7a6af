//! Error types for emu-sync-core

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::storage::StorageError;

/// Result type for emu-sync-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a run before or instead of transferring files
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The run lock is held by another process
    #[error("another sync is already running (lock: {lock_path})")]
    AlreadyRunning { lock_path: PathBuf },

    /// Upload source directory does not exist
    #[error("Source directory does not exist: {path}")]
    SourceMissing { path: PathBuf },

    /// Verify needs a local manifest to check against
    #[error("Local manifest not found at {path}")]
    LocalManifestMissing { path: PathBuf },

    /// Remote manifest could not be fetched
    #[error("Failed to download remote manifest: {source}")]
    RemoteManifest {
        #[source]
        source: StorageError,
    },

    /// Manifest JSON is malformed
    #[error("Failed to parse manifest: {source}")]
    ManifestParse {
        #[source]
        source: serde_json::Error,
    },

    /// New manifest could not be published to the bucket
    #[error("Failed to publish manifest: {source}")]
    PublishManifest {
        #[source]
        source: StorageError,
    },

    /// Cancellation fired before the run could produce a consistent result
    #[error("Run cancelled")]
    Cancelled,

    /// Per-user state directory could not be resolved
    #[error("Could not determine the per-user data directory")]
    NoDataDir,

    /// Human-readable size string could not be parsed
    #[error("Invalid size {input:?}: {reason}")]
    InvalidSize { input: String, reason: String },

    /// Run lock could not be opened or released
    #[error("Lock error at {path}: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Transparent wrappers for underlying errors
    /// Filesystem error from emu-sync-fs
    #[error(transparent)]
    Fs(#[from] emu_sync_fs::Error),

    /// Storage backend error
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Standard I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// A failure confined to one file that did not stop the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileError {
    /// Object key the failure belongs to
    pub key: String,
    /// The error and its cause chain, outermost first
    pub message: String,
}

impl FileError {
    pub fn new(key: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        Self {
            key: key.into(),
            message: error_chain(err),
        }
    }
}

impl std::fmt::Display for FileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

/// Render an error and every `source()` beneath it as `outer: inner: root`.
pub fn error_chain(err: &(dyn std::error::Error + 'static)) -> String {
    let mut message = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let text = cause.to_string();
        // thiserror messages often embed their source already
        if !message.ends_with(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        current = cause.source();
    }
    message
}
