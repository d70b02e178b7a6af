//! SyncEngine implementation

use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::cancel::CancelToken;
use crate::config::SyncSelection;
use crate::error::FileError;
use crate::lock::RunLock;
use crate::manifest::{DiffResult, FileEntry, Manifest, diff};
use crate::pool::{JobOutcome, SaveThreshold, run_jobs};
use crate::progress::{DoneCounts, ProgressReporter};
use crate::retry::{RetryError, RetryPolicy, with_backoff};
use crate::storage::{Backend, StorageError, StorageResult};
use crate::sync::verify::{VerifyReport, verify};
use crate::{Error, Result};
use emu_sync_fs::{TEMP_SUFFIX, io, key_to_path};

/// Inputs for one sync run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOptions {
    /// Local tree the bucket is mirrored into
    pub root: PathBuf,
    /// Record of what this device last synced
    pub local_manifest: PathBuf,
    #[serde(default)]
    pub selection: SyncSelection,
    /// Remove local files that left the bucket
    pub delete: bool,
    /// Per-run override that keeps files even when `delete` is set
    #[serde(default)]
    pub no_delete: bool,
    #[serde(default)]
    pub dry_run: bool,
    pub workers: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Bytes downloaded between checkpoint saves; zero means the default
    #[serde(default)]
    pub save_threshold: u64,
}

impl SyncOptions {
    pub fn new(root: impl Into<PathBuf>, local_manifest: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            local_manifest: local_manifest.into(),
            selection: SyncSelection::default(),
            delete: true,
            no_delete: false,
            dry_run: false,
            workers: 1,
            retry: RetryPolicy::default(),
            save_threshold: 0,
        }
    }

    pub fn deletion_allowed(&self) -> bool {
        self.delete && !self.no_delete
    }
}

/// What a sync run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Keys written to disk (or planned, in dry-run)
    pub downloaded: Vec<String>,
    /// Keys removed from disk (or planned, in dry-run)
    pub deleted: Vec<String>,
    /// Keys gone from the bucket but kept on disk because deletion is off
    pub retained: Vec<String>,
    /// Selected remote keys that needed no transfer
    pub skipped: usize,
    pub errors: Vec<FileError>,
    /// Keys not attempted because the run was cancelled
    pub cancelled: Vec<String>,
    pub dry_run: bool,
}

impl SyncReport {
    /// True when every planned action succeeded
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.cancelled.is_empty()
    }

    /// Multi-line human summary
    pub fn summary(&self) -> String {
        let mut out = String::new();
        if self.dry_run {
            out.push_str("Dry run, nothing was changed\n");
        }
        out.push_str(&format!("Downloaded: {} files\n", self.downloaded.len()));
        out.push_str(&format!("Deleted: {} files\n", self.deleted.len()));
        if !self.retained.is_empty() {
            out.push_str(&format!(
                "Retained: {} files (deletion disabled)\n",
                self.retained.len()
            ));
        }
        out.push_str(&format!("Unchanged: {} files\n", self.skipped));
        if !self.cancelled.is_empty() {
            out.push_str(&format!("Cancelled: {} files\n", self.cancelled.len()));
        }
        if !self.errors.is_empty() {
            out.push_str(&format!("Errors: {}\n", self.errors.len()));
            for err in &self.errors {
                out.push_str(&format!("  - {err}\n"));
            }
        }
        out.push_str(&format!(
            "Total: {} files\n",
            self.downloaded.len() + self.skipped
        ));
        out
    }

    fn done_counts(&self) -> DoneCounts {
        DoneCounts {
            downloaded: self.downloaded.len(),
            deleted: self.deleted.len(),
            retained: self.retained.len(),
            errors: self.errors.len(),
            skipped: self.skipped + self.cancelled.len(),
        }
    }
}

/// Remote manifest narrowed to the selection, the local record, and their diff
struct Plan {
    remote: Manifest,
    local: Manifest,
    changes: DiffResult,
}

/// Mirrors a bucket into a local tree
pub struct SyncEngine {
    backend: Arc<dyn Backend>,
    lock: Arc<dyn RunLock>,
    progress: ProgressReporter,
    cancel: CancelToken,
}

impl SyncEngine {
    /// Create a new SyncEngine
    pub fn new(backend: Arc<dyn Backend>, lock: Arc<dyn RunLock>) -> Self {
        Self {
            backend,
            lock,
            progress: ProgressReporter::disabled(),
            cancel: CancelToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// What the next sync would change, without touching disk or the bucket.
    ///
    /// Files missing from disk are not detected here; see [`SyncEngine::run`].
    pub fn status(&self, opts: &SyncOptions) -> Result<DiffResult> {
        Ok(self.plan(opts)?.changes)
    }

    /// Run one sync.
    ///
    /// # Errors
    ///
    /// Fails before any transfer if the lock is held or the remote manifest
    /// cannot be fetched or parsed, and after transfers if the local
    /// manifest cannot be saved. Per-file failures land in the report.
    pub fn run(&self, opts: &SyncOptions) -> Result<SyncReport> {
        let guard = if opts.dry_run {
            None
        } else {
            Some(self.lock.acquire()?)
        };

        let report = self.run_locked(opts)?;

        if let Some(guard) = guard {
            guard.release()?;
        }
        Ok(report)
    }

    /// Re-check every locally recorded file while holding the run lock
    pub fn verify(&self, opts: &SyncOptions) -> Result<VerifyReport> {
        let guard = self.lock.acquire()?;
        let report = verify(&opts.root, &opts.local_manifest)?;
        guard.release()?;
        Ok(report)
    }

    fn plan(&self, opts: &SyncOptions) -> Result<Plan> {
        let data = self
            .backend
            .download_manifest()
            .map_err(|source| Error::RemoteManifest { source })?;
        let remote = Manifest::parse_json(&data)?;
        let remote = remote.filtered(|key| opts.selection.should_sync(key));
        let local = load_local(&opts.local_manifest);
        let changes = diff(&remote, &local);
        Ok(Plan {
            remote,
            local,
            changes,
        })
    }

    fn run_locked(&self, opts: &SyncOptions) -> Result<SyncReport> {
        let Plan {
            remote,
            mut local,
            mut changes,
        } = self.plan(opts)?;

        heal_drift(&opts.root, &remote, &mut local, &mut changes);

        if !opts.dry_run {
            clean_temp_files(&opts.root);
        }

        let to_download = changes.transfer_keys();
        let mut report = SyncReport {
            skipped: remote.len().saturating_sub(to_download.len()),
            dry_run: opts.dry_run,
            ..SyncReport::default()
        };

        if opts.dry_run {
            for key in &to_download {
                info!(key = %key, "would download");
            }
            report.downloaded = to_download;
        } else {
            let jobs = to_download
                .into_iter()
                .filter_map(|key| remote.get(&key).cloned().map(|entry| (key, entry)))
                .collect();
            self.download_all(jobs, &mut local, opts, &mut report);
        }

        self.apply_deletions(&changes.deleted, &mut local, opts, &mut report);

        info!(
            downloaded = report.downloaded.len(),
            deleted = report.deleted.len(),
            retained = report.retained.len(),
            skipped = report.skipped,
            errors = report.errors.len(),
            "sync complete"
        );
        self.progress.done(report.done_counts());

        if !opts.dry_run {
            local.save_to_disk(&opts.local_manifest)?;
        }
        Ok(report)
    }

    fn download_all(
        &self,
        jobs: Vec<(String, FileEntry)>,
        local: &mut Manifest,
        opts: &SyncOptions,
        report: &mut SyncReport,
    ) {
        let mut checkpoint = SaveThreshold::new(opts.save_threshold);

        run_jobs(
            jobs,
            opts.workers,
            &self.cancel,
            |(key, entry)| {
                self.progress.start(key, entry.size);
                with_backoff(&opts.retry, &self.cancel, || {
                    download_one(self.backend.as_ref(), &opts.root, key)
                })
            },
            |outcome| match outcome {
                JobOutcome::Finished {
                    job: (key, entry),
                    output: Ok(()),
                } => {
                    debug!(key = %key, "downloaded");
                    self.progress.complete(&key);
                    let size = u64::try_from(entry.size).unwrap_or(0);
                    local.insert(key.clone(), entry);
                    report.downloaded.push(key);
                    if checkpoint.record(size) {
                        debug!("saving local manifest checkpoint");
                        if let Err(e) = local.save_to_disk(&opts.local_manifest) {
                            warn!(error = %e, "failed to save local manifest checkpoint");
                        }
                    }
                }
                JobOutcome::Finished {
                    job: (key, _),
                    output: Err(RetryError::Cancelled),
                }
                | JobOutcome::NotStarted((key, _)) => {
                    self.progress.skip(&key);
                    report.cancelled.push(key);
                }
                JobOutcome::Finished {
                    job: (key, _),
                    output: Err(e),
                } => {
                    warn!(key = %key, error = %e, "download failed");
                    let err = FileError::new(&key, &e);
                    self.progress.file_error(&key, &err.message);
                    report.errors.push(err);
                }
            },
        );
        report.downloaded.sort();
        report.cancelled.sort();
    }

    fn apply_deletions(
        &self,
        keys: &[String],
        local: &mut Manifest,
        opts: &SyncOptions,
        report: &mut SyncReport,
    ) {
        let allowed = opts.deletion_allowed();
        for key in keys {
            if !allowed {
                if opts.dry_run {
                    info!(key = %key, "would keep (deletion disabled)");
                } else {
                    debug!(key = %key, "keeping, deletion disabled");
                    self.progress.retain(key);
                }
                report.retained.push(key.clone());
                continue;
            }
            if opts.dry_run {
                info!(key = %key, "would delete");
                report.deleted.push(key.clone());
                continue;
            }
            if self.cancel.is_cancelled() {
                report.cancelled.push(key.clone());
                continue;
            }

            match io::remove_if_exists(&key_to_path(&opts.root, key)) {
                Ok(_) => {
                    debug!(key = %key, "deleted");
                    local.remove(key);
                    self.progress.delete(key);
                    report.deleted.push(key.clone());
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "delete failed");
                    let err = FileError::new(key, &e);
                    self.progress.file_error(key, &err.message);
                    report.errors.push(err);
                }
            }
        }
    }
}

fn load_local(path: &Path) -> Manifest {
    match Manifest::load_from_disk(path) {
        Ok(manifest) => manifest,
        Err(Error::Fs(e)) if e.is_not_found() => {
            debug!(path = %path.display(), "no local manifest, treating as first sync");
            Manifest::new()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "unreadable local manifest, treating as first sync");
            Manifest::new()
        }
    }
}

/// Queue selected keys the local manifest lists but the disk lacks
fn heal_drift(root: &Path, remote: &Manifest, local: &mut Manifest, changes: &mut DiffResult) {
    let queued: HashSet<String> = changes.transfer_keys().into_iter().collect();
    let mut healed = Vec::new();

    for key in remote.files.keys() {
        if queued.contains(key) || !local.contains(key) {
            continue;
        }
        let path = key_to_path(root, key);
        if let Err(e) = fs::metadata(&path)
            && e.kind() == ErrorKind::NotFound
        {
            info!(key = %key, "file missing from disk, will re-download");
            healed.push(key.clone());
        }
    }

    for key in healed {
        local.remove(&key);
        changes.added.push(key);
    }
    changes.added.sort();
}

/// Remove partial downloads left by an interrupted run
fn clean_temp_files(root: &Path) {
    if !root.is_dir() {
        return;
    }
    for entry in WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if entry.file_type().is_dir() {
            continue;
        }
        let is_temp = entry
            .file_name()
            .to_str()
            .is_some_and(|name| name.ends_with(TEMP_SUFFIX));
        if !is_temp {
            continue;
        }
        debug!(path = %entry.path().display(), "removing leftover temp file");
        if let Err(e) = io::remove_if_exists(entry.path()) {
            warn!(error = %e, "failed to remove temp file");
        }
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(TEMP_SUFFIX);
    PathBuf::from(tmp)
}

/// Download `key` beside its final path, then rename it into place
fn download_one(backend: &dyn Backend, root: &Path, key: &str) -> StorageResult<()> {
    let path = key_to_path(root, key);
    let tmp = temp_path(&path);

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| StorageError::io("create directory", key, e))?;
    }

    if let Err(e) = backend.download_file(key, &tmp) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    if let Err(e) = fs::rename(&tmp, &path) {
        let _ = fs::remove_file(&tmp);
        return Err(StorageError::io("rename", key, e));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::NoopRunLock;
    use crate::storage::MemoryBackend;
    use emu_sync_fs::checksum::hash_bytes;

    fn publish(backend: &MemoryBackend, files: &[(&str, &[u8])]) {
        let mut manifest = Manifest::new();
        for (key, data) in files {
            backend.put_object(*key, data.to_vec());
            manifest.insert(*key, FileEntry::new(data.len() as i64, hash_bytes(data)));
        }
        backend.upload_manifest(&manifest.to_json().unwrap()).unwrap();
    }

    #[test]
    fn temp_path_appends_suffix() {
        let path = Path::new("/tmp/roms/a.sfc");
        assert_eq!(
            temp_path(path),
            PathBuf::from(format!("/tmp/roms/a.sfc{TEMP_SUFFIX}"))
        );
    }

    #[test]
    fn leftover_temp_files_are_cleaned() {
        let dir = tempfile::tempdir().unwrap();
        let stale = dir.path().join("roms").join(format!("x.sfc{TEMP_SUFFIX}"));
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"partial").unwrap();
        let keep = dir.path().join("roms").join("y.sfc");
        fs::write(&keep, b"keep").unwrap();

        clean_temp_files(dir.path());

        assert!(!stale.exists());
        assert!(keep.exists());
    }

    #[test]
    fn missing_remote_manifest_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let engine = SyncEngine::new(Arc::new(MemoryBackend::new()), Arc::new(NoopRunLock));
        let opts = SyncOptions::new(dir.path().join("emu"), dir.path().join("local.json"));

        let err = engine.run(&opts).unwrap_err();
        assert!(matches!(err, Error::RemoteManifest { .. }));
        assert!(!opts.local_manifest.exists());
    }

    #[test]
    fn status_does_not_touch_disk() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        publish(&backend, &[("roms/a.sfc", b"aaa"), ("bios/b.bin", b"bb")]);
        let engine = SyncEngine::new(backend, Arc::new(NoopRunLock));
        let opts = SyncOptions::new(dir.path().join("emu"), dir.path().join("local.json"));

        let changes = engine.status(&opts).unwrap();
        assert_eq!(changes.added, vec!["bios/b.bin", "roms/a.sfc"]);
        assert!(!opts.root.exists());
        assert!(!opts.local_manifest.exists());
    }

    #[test]
    fn selection_limits_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MemoryBackend::new());
        publish(
            &backend,
            &[("roms/a.sfc", b"aaa"), ("saves/s.srm", b"ss"), ("bios/b.bin", b"bb")],
        );
        let engine = SyncEngine::new(backend, Arc::new(NoopRunLock));
        let mut opts = SyncOptions::new(dir.path().join("emu"), dir.path().join("local.json"));
        opts.selection = SyncSelection::default().with_exclude(["bios/b.bin"]);

        let report = engine.run(&opts).unwrap();
        assert_eq!(report.downloaded, vec!["roms/a.sfc"]);
        assert!(!opts.root.join("saves").exists());
        assert!(!opts.root.join("bios").exists());
    }
}
