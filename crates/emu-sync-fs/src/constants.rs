//! Well-known file names for per-device sync state.

use std::path::Path;

/// Suffix appended to a destination path while a download is in flight.
///
/// Files carrying this suffix are never committed content; any left on disk
/// belong to an interrupted run and are removed before the next sync.
pub const TEMP_SUFFIX: &str = ".emu-sync-tmp";

/// Files kept in the per-device state directory, outside the synced tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateFile {
    /// Last-known-synced manifest for this device
    LocalManifest,
    /// (path, size, mtime) -> hash memo used by uploads
    UploadCache,
    /// Advisory lock guarding mutating runs
    SyncLock,
}

impl StateFile {
    /// Get the file name of this state file.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LocalManifest => "local-manifest.json",
            Self::UploadCache => "upload-cache.json",
            Self::SyncLock => "sync.lock",
        }
    }
}

impl AsRef<Path> for StateFile {
    fn as_ref(&self) -> &Path {
        Path::new(self.as_str())
    }
}

impl AsRef<str> for StateFile {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::fmt::Display for StateFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
