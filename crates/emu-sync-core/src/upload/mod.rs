//! Upload engine
//!
//! Scans a source tree into a manifest, diffs it against the published
//! manifest and pushes the difference to the bucket. The new manifest is
//! published last, so recipients never see keys the bucket lacks.

mod scan;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::HashCache;
use crate::cancel::CancelToken;
use crate::config::DEFAULT_SYNC_DIRS;
use crate::error::FileError;
use crate::lock::RunLock;
use crate::manifest::{Manifest, diff};
use crate::pool::{JobOutcome, run_jobs};
use crate::progress::{DoneCounts, ProgressReporter};
use crate::retry::{RetryError, RetryPolicy, with_backoff};
use crate::storage::{Backend, StorageError};
use crate::{Error, Result};
use emu_sync_fs::key_to_path;

use scan::{ScanOptions, scan};

/// Inputs for one upload run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadOptions {
    /// Root of the tree being published
    pub source: PathBuf,
    /// Subdirectories of `source` to include
    pub sync_dirs: Vec<String>,
    #[serde(default)]
    pub dry_run: bool,
    /// Publish only the manifest, skipping file transfers
    #[serde(default)]
    pub manifest_only: bool,
    pub workers: usize,
    #[serde(default)]
    pub retry: RetryPolicy,
    pub skip_dotfiles: bool,
    /// Where the hash cache lives
    pub cache_path: PathBuf,
    /// Also save the published manifest here
    #[serde(default)]
    pub local_manifest_mirror: Option<PathBuf>,
}

impl UploadOptions {
    pub fn new(source: impl Into<PathBuf>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            sync_dirs: DEFAULT_SYNC_DIRS.iter().map(|d| d.to_string()).collect(),
            dry_run: false,
            manifest_only: false,
            workers: 1,
            retry: RetryPolicy::default(),
            skip_dotfiles: true,
            cache_path: cache_path.into(),
            local_manifest_mirror: None,
        }
    }

    /// Mirror the published manifest to `local_manifest` when this machine
    /// uploads from its own sync target.
    ///
    /// The comparison is plain path equality; a symlinked or otherwise
    /// differently spelled path does not match.
    pub fn mirror_if_source_is(mut self, sync_target: &Path, local_manifest: &Path) -> Self {
        if self.source.as_os_str() == sync_target.as_os_str() {
            self.local_manifest_mirror = Some(local_manifest.to_path_buf());
        }
        self
    }
}

/// What an upload run did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadReport {
    /// Keys transferred (or planned, in dry-run)
    pub uploaded: Vec<String>,
    /// Remote keys deleted (or planned, in dry-run)
    pub deleted: Vec<String>,
    /// Scanned files that needed no transfer
    pub skipped: usize,
    pub errors: Vec<FileError>,
    /// Keys not attempted because the run was cancelled
    pub cancelled: Vec<String>,
    pub cache_hits: usize,
    pub hashed: usize,
    pub total_files: usize,
    pub dry_run: bool,
}

impl UploadReport {
    /// True when every planned action succeeded
    pub fn is_success(&self) -> bool {
        self.errors.is_empty() && self.cancelled.is_empty()
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        let prefix = if self.dry_run { "Dry run: " } else { "" };
        let mut line = format!(
            "{prefix}{} uploaded, {} deleted, {} unchanged, {} errors ({} files, {} cached, {} hashed)",
            self.uploaded.len(),
            self.deleted.len(),
            self.skipped,
            self.errors.len(),
            self.total_files,
            self.cache_hits,
            self.hashed,
        );
        if !self.cancelled.is_empty() {
            line.push_str(&format!(", {} cancelled", self.cancelled.len()));
        }
        line
    }

    fn done_counts(&self) -> DoneCounts {
        DoneCounts {
            downloaded: self.uploaded.len(),
            deleted: self.deleted.len(),
            retained: 0,
            errors: self.errors.len(),
            skipped: self.skipped + self.cancelled.len(),
        }
    }
}

/// Publishes a local tree to a bucket
pub struct Uploader {
    backend: Arc<dyn Backend>,
    lock: Arc<dyn RunLock>,
    progress: ProgressReporter,
    cancel: CancelToken,
}

impl Uploader {
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

    /// Run one upload.
    ///
    /// # Errors
    ///
    /// Fails before any transfer if the source is missing, the lock is
    /// held, the run is cancelled during the scan, or the published
    /// manifest exists but cannot be read. Fails after transfers if the new
    /// manifest cannot be published. Per-file failures land in the report.
    pub fn run(&self, opts: &UploadOptions) -> Result<UploadReport> {
        if !opts.source.is_dir() {
            return Err(Error::SourceMissing {
                path: opts.source.clone(),
            });
        }

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

    fn run_locked(&self, opts: &UploadOptions) -> Result<UploadReport> {
        let mut cache = HashCache::load(&opts.cache_path);
        info!(source = %opts.source.display(), "scanning source tree");
        let scanned = scan(
            &ScanOptions {
                source: &opts.source,
                sync_dirs: &opts.sync_dirs,
                skip_dotfiles: opts.skip_dotfiles,
                workers: opts.workers,
            },
            &mut cache,
            &self.cancel,
        )?;

        let mut report = UploadReport {
            cache_hits: scanned.cache_hits,
            hashed: scanned.hashed,
            total_files: scanned.manifest.len(),
            errors: scanned.errors,
            dry_run: opts.dry_run,
            ..UploadReport::default()
        };
        info!(
            files = report.total_files,
            cached = report.cache_hits,
            hashed = report.hashed,
            "scan complete"
        );

        if !opts.dry_run {
            let seen: HashSet<&str> = scanned.manifest.files.keys().map(String::as_str).collect();
            cache.prune(&seen);
            if let Err(e) = cache.save(&opts.cache_path) {
                warn!(path = %opts.cache_path.display(), error = %e, "failed to save hash cache");
            }
        }

        let mut manifest = scanned.manifest;

        if opts.manifest_only {
            report.skipped = report.total_files;
            if !opts.dry_run {
                self.publish(&manifest, opts)?;
            }
            self.progress.done(report.done_counts());
            return Ok(report);
        }

        let previous = self.fetch_previous()?;

        // Files that exist but could not be read keep their published entry
        for key in &scanned.failed_keys {
            if let Some(entry) = previous.get(key) {
                manifest.insert(key.clone(), entry.clone());
            }
        }

        let changes = diff(&manifest, &previous);
        let to_upload = changes.transfer_keys();
        let mut to_delete = changes.deleted.clone();
        if scanned.incomplete && !to_delete.is_empty() {
            warn!(
                count = to_delete.len(),
                "source tree was not fully readable, skipping remote deletions"
            );
            for key in to_delete.drain(..) {
                if let Some(entry) = previous.get(&key) {
                    manifest.insert(key, entry.clone());
                }
            }
        }
        report.skipped = report.total_files.saturating_sub(to_upload.len());

        if opts.dry_run {
            for key in &to_upload {
                info!(key = %key, "would upload");
            }
            for key in &to_delete {
                info!(key = %key, "would delete");
            }
            report.uploaded = to_upload;
            report.deleted = to_delete;
            self.progress.done(report.done_counts());
            return Ok(report);
        }

        self.transfer(&to_upload, &mut manifest, &previous, opts, &mut report);
        self.delete_removed(&to_delete, &mut manifest, &previous, opts, &mut report);

        self.publish(&manifest, opts)?;
        info!("{}", report.summary());
        self.progress.done(report.done_counts());
        Ok(report)
    }

    fn fetch_previous(&self) -> Result<Manifest> {
        match self.backend.download_manifest() {
            Ok(data) => Manifest::parse_json(&data),
            Err(e) if e.is_not_found() => {
                info!("no published manifest, treating as first upload");
                Ok(Manifest::new())
            }
            Err(source) => Err(Error::RemoteManifest { source }),
        }
    }

    fn transfer(
        &self,
        keys: &[String],
        manifest: &mut Manifest,
        previous: &Manifest,
        opts: &UploadOptions,
        report: &mut UploadReport,
    ) {
        let sizes: Vec<(String, i64)> = keys
            .iter()
            .map(|key| (key.clone(), manifest.get(key).map(|e| e.size).unwrap_or(0)))
            .collect();

        run_jobs(
            sizes,
            opts.workers,
            &self.cancel,
            |(key, size)| {
                self.progress.start(key, *size);
                let path = key_to_path(&opts.source, key);
                with_backoff(&opts.retry, &self.cancel, || {
                    self.backend.upload_file(key, &path)
                })
            },
            |outcome| match outcome {
                JobOutcome::Finished {
                    job: (key, _),
                    output: Ok(()),
                } => {
                    debug!(key = %key, "uploaded");
                    self.progress.complete(&key);
                    report.uploaded.push(key);
                }
                JobOutcome::Finished {
                    job: (key, _),
                    output: Err(RetryError::Cancelled),
                }
                | JobOutcome::NotStarted((key, _)) => {
                    self.progress.skip(&key);
                    revert_entry(manifest, previous, &key);
                    report.cancelled.push(key);
                }
                JobOutcome::Finished {
                    job: (key, _),
                    output: Err(e),
                } => {
                    warn!(key = %key, error = %e, "upload failed");
                    let err = FileError::new(&key, &e);
                    self.progress.file_error(&key, &err.message);
                    revert_entry(manifest, previous, &key);
                    report.errors.push(err);
                }
            },
        );
        report.uploaded.sort();
    }

    fn delete_removed(
        &self,
        keys: &[String],
        manifest: &mut Manifest,
        previous: &Manifest,
        opts: &UploadOptions,
        report: &mut UploadReport,
    ) {
        for key in keys {
            if self.cancel.is_cancelled() {
                revert_entry(manifest, previous, key);
                report.cancelled.push(key.clone());
                continue;
            }
            match with_backoff(&opts.retry, &self.cancel, || self.backend.delete_object(key)) {
                Ok(()) => {
                    debug!(key = %key, "deleted remote object");
                    self.progress.delete(key);
                    report.deleted.push(key.clone());
                }
                Err(RetryError::Cancelled) => {
                    revert_entry(manifest, previous, key);
                    report.cancelled.push(key.clone());
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "delete failed");
                    let err = FileError::new(key, &e);
                    self.progress.file_error(key, &err.message);
                    revert_entry(manifest, previous, key);
                    report.errors.push(err);
                }
            }
        }
    }

    fn publish(&self, manifest: &Manifest, opts: &UploadOptions) -> Result<()> {
        let data = manifest.to_json()?;
        self.backend
            .upload_manifest(&data)
            .map_err(|source: StorageError| Error::PublishManifest { source })?;
        info!(files = manifest.len(), "published manifest");

        if let Some(mirror) = &opts.local_manifest_mirror {
            if let Err(e) = manifest.save_to_disk(mirror) {
                warn!(path = %mirror.display(), error = %e, "failed to mirror manifest locally");
            } else {
                debug!(path = %mirror.display(), "mirrored manifest locally");
            }
        }
        Ok(())
    }
}

/// Make `manifest` describe what the bucket still holds for `key`
fn revert_entry(manifest: &mut Manifest, previous: &Manifest, key: &str) {
    match previous.get(key) {
        Some(entry) => manifest.insert(key, entry.clone()),
        None => {
            manifest.remove(key);
        }
    }
}
