//! In-memory backend with per-key failure injection

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{Backend, StorageError, StorageResult};
use crate::ratelimit::{RateLimiter, maybe_throttle};

/// In-memory object store.
///
/// Records every call as `"<Operation>:<key>"` and can be told to fail
/// specific keys, either permanently, a fixed number of times, or midway
/// through writing a download.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
    limiter: Option<Arc<RateLimiter>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    objects: BTreeMap<String, Vec<u8>>,
    calls: Vec<String>,
    upload_errors: HashMap<String, String>,
    download_errors: HashMap<String, String>,
    delete_errors: HashMap<String, String>,
    /// key -> bytes written before the download fails
    partial_downloads: HashMap<String, usize>,
    /// key -> remaining failures before downloads succeed
    transient_downloads: HashMap<String, u32>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge every file transfer against `limiter`
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Store an object directly, bypassing the call log
    pub fn put_object(&self, key: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.state().objects.insert(key.into(), data.into());
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state().objects.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.state().objects.contains_key(key)
    }

    /// All stored keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.state().objects.keys().cloned().collect()
    }

    /// Calls made so far, in order
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Calls whose operation matches `operation`, e.g. `"UploadFile"`
    pub fn calls_to(&self, operation: &str) -> Vec<String> {
        let prefix = format!("{operation}:");
        self.state()
            .calls
            .iter()
            .filter_map(|c| c.strip_prefix(&prefix).map(str::to_string))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn fail_uploads(&self, key: impl Into<String>, message: impl Into<String>) {
        self.state().upload_errors.insert(key.into(), message.into());
    }

    pub fn fail_downloads(&self, key: impl Into<String>, message: impl Into<String>) {
        self.state()
            .download_errors
            .insert(key.into(), message.into());
    }

    pub fn fail_deletes(&self, key: impl Into<String>, message: impl Into<String>) {
        self.state().delete_errors.insert(key.into(), message.into());
    }

    /// Make downloads of `key` write `bytes` bytes and then fail
    pub fn fail_download_midway(&self, key: impl Into<String>, bytes: usize) {
        self.state().partial_downloads.insert(key.into(), bytes);
    }

    /// Make the next `times` downloads of `key` fail, then succeed
    pub fn fail_downloads_transiently(&self, key: impl Into<String>, times: u32) {
        self.state().transient_downloads.insert(key.into(), times);
    }

    pub fn clear_failures(&self) {
        let mut state = self.state();
        state.upload_errors.clear();
        state.download_errors.clear();
        state.delete_errors.clear();
        state.partial_downloads.clear();
        state.transient_downloads.clear();
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn remote_error(operation: &'static str, key: &str, message: &str) -> StorageError {
        StorageError::Remote {
            operation,
            key: key.to_string(),
            message: message.to_string(),
        }
    }

    /// Record a download call and decide what it should do
    fn begin_download(&self, operation: &'static str, key: &str) -> StorageResult<Download> {
        let mut state = self.state();
        state.calls.push(format!("{operation}:{key}"));

        if let Some(message) = state.download_errors.get(key) {
            return Err(Self::remote_error("download", key, message));
        }
        if let Some(remaining) = state.transient_downloads.get_mut(key)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(Self::remote_error("download", key, "transient failure"));
        }

        let data = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::not_found(key))?;
        Ok(match state.partial_downloads.get(key) {
            Some(&cut) => Download::Partial(data[..cut.min(data.len())].to_vec()),
            None => Download::Full(data),
        })
    }
}

enum Download {
    Full(Vec<u8>),
    Partial(Vec<u8>),
}

impl Backend for MemoryBackend {
    fn ping(&self) -> StorageResult<()> {
        self.state().calls.push("Ping".to_string());
        Ok(())
    }

    fn upload_file(&self, key: &str, local_path: &Path) -> StorageResult<()> {
        {
            let mut state = self.state();
            state.calls.push(format!("UploadFile:{key}"));
            if let Some(message) = state.upload_errors.get(key) {
                return Err(Self::remote_error("upload", key, message));
            }
        }

        let file = fs::File::open(local_path).map_err(|e| StorageError::io("upload", key, e))?;
        let mut data = Vec::new();
        std::io::copy(&mut maybe_throttle(file, self.limiter.as_ref()), &mut data)
            .map_err(|e| StorageError::io("upload", key, e))?;

        self.state().objects.insert(key.to_string(), data);
        Ok(())
    }

    fn upload_bytes(&self, key: &str, data: &[u8]) -> StorageResult<()> {
        let mut state = self.state();
        state.calls.push(format!("UploadBytes:{key}"));
        if let Some(message) = state.upload_errors.get(key) {
            return Err(Self::remote_error("upload", key, message));
        }
        state.objects.insert(key.to_string(), data.to_vec());
        Ok(())
    }

    fn download_file(&self, key: &str, local_path: &Path) -> StorageResult<()> {
        let download = self.begin_download("DownloadFile", key)?;
        let (data, complete) = match download {
            Download::Full(data) => (data, true),
            Download::Partial(data) => (data, false),
        };

        let mut file =
            fs::File::create(local_path).map_err(|e| StorageError::io("download", key, e))?;
        std::io::copy(
            &mut maybe_throttle(Cursor::new(data), self.limiter.as_ref()),
            &mut file,
        )
        .map_err(|e| StorageError::io("download", key, e))?;
        file.flush()
            .map_err(|e| StorageError::io("download", key, e))?;

        if complete {
            Ok(())
        } else {
            Err(StorageError::io(
                "download",
                key,
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"),
            ))
        }
    }

    fn download_bytes(&self, key: &str) -> StorageResult<Vec<u8>> {
        match self.begin_download("DownloadBytes", key)? {
            Download::Full(data) => Ok(data),
            Download::Partial(_) => Err(StorageError::io(
                "download",
                key,
                std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset"),
            )),
        }
    }

    fn delete_object(&self, key: &str) -> StorageResult<()> {
        let mut state = self.state();
        state.calls.push(format!("DeleteObject:{key}"));
        if let Some(message) = state.delete_errors.get(key) {
            return Err(Self::remote_error("delete", key, message));
        }
        state.objects.remove(key);
        Ok(())
    }
}
