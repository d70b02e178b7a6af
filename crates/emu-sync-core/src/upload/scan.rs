//! Source tree scanning
//!
//! Walks the included directories, reuses cached hashes where size and
//! mtime match, and hashes the rest on the worker pool. Only this thread
//! touches the cache.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::cache::HashCache;
use crate::cancel::CancelToken;
use crate::error::FileError;
use crate::manifest::{FileEntry, Manifest};
use crate::pool::{JobOutcome, run_jobs};
use crate::{Error, Result};
use emu_sync_fs::{checksum, is_hidden, key_from_relative, key_to_path};

/// Result of scanning a source tree
#[derive(Debug, Default)]
pub(crate) struct Scan {
    pub manifest: Manifest,
    pub cache_hits: usize,
    pub hashed: usize,
    /// Keys that exist locally but could not be stat'ed or hashed
    pub failed_keys: Vec<String>,
    pub errors: Vec<FileError>,
    /// True when a directory could not be fully walked
    pub incomplete: bool,
}

struct HashJob {
    key: String,
    path: PathBuf,
    size: i64,
    mtime: DateTime<Utc>,
}

pub(crate) struct ScanOptions<'a> {
    pub source: &'a Path,
    pub sync_dirs: &'a [String],
    pub skip_dotfiles: bool,
    pub workers: usize,
}

pub(crate) fn scan(
    opts: &ScanOptions<'_>,
    cache: &mut HashCache,
    cancel: &CancelToken,
) -> Result<Scan> {
    let mut result = Scan {
        manifest: Manifest::new(),
        ..Scan::default()
    };
    let mut jobs = Vec::new();
    // Overlapping sync dirs reach the same file more than once
    let mut seen = HashSet::new();

    for dir in opts.sync_dirs {
        let dir_path = key_to_path(opts.source, dir.trim_matches('/'));
        if !dir_path.is_dir() {
            debug!(dir = %dir, "skipping: directory does not exist");
            continue;
        }

        let skip_dotfiles = opts.skip_dotfiles;
        let walker = WalkDir::new(&dir_path)
            .follow_links(true)
            .into_iter()
            .filter_entry(move |e| !(skip_dotfiles && e.depth() > 0 && is_hidden(e.file_name())));

        for entry in walker {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(dir = %dir, error = %e, "error walking source tree");
                    record_walk_error(&mut result, opts.source, &e);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }

            let key = match key_from_relative(opts.source, entry.path()) {
                Ok(key) => key,
                Err(e) => {
                    warn!(path = %entry.path().display(), error = %e, "skipping unsyncable path");
                    result
                        .errors
                        .push(FileError::new(entry.path().display().to_string(), &e));
                    continue;
                }
            };
            if !seen.insert(key.clone()) {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(e) => {
                    result.errors.push(FileError::new(&key, &e));
                    result.failed_keys.push(key);
                    continue;
                }
            };
            let size = i64::try_from(meta.len()).unwrap_or(i64::MAX);
            let mtime = match meta.modified() {
                Ok(t) => DateTime::<Utc>::from(t),
                Err(e) => {
                    result.errors.push(FileError::new(&key, &e));
                    result.failed_keys.push(key);
                    continue;
                }
            };

            if let Some(hash) = cache.lookup(&key, size, mtime) {
                debug!(key = %key, "cached");
                result.manifest.insert(key, FileEntry::new(size, hash));
                result.cache_hits += 1;
            } else {
                jobs.push(HashJob {
                    key,
                    path: entry.into_path(),
                    size,
                    mtime,
                });
            }
        }
    }

    let mut cancelled = false;
    run_jobs(
        jobs,
        opts.workers,
        cancel,
        |job| {
            debug!(key = %job.key, "hashing");
            checksum::hash_file(&job.path)
        },
        |outcome| match outcome {
            JobOutcome::Finished { job, output: Ok(hash) } => {
                cache.update(job.key.clone(), job.size, job.mtime, hash.clone());
                result.manifest.insert(job.key, FileEntry::new(job.size, hash));
                result.hashed += 1;
            }
            JobOutcome::Finished { job, output: Err(e) } => {
                warn!(key = %job.key, error = %e, "failed to hash");
                result.errors.push(FileError::new(&job.key, &e));
                result.failed_keys.push(job.key);
            }
            JobOutcome::NotStarted(_) => cancelled = true,
        },
    );
    if cancelled {
        return Err(Error::Cancelled);
    }

    Ok(result)
}

fn record_walk_error(result: &mut Scan, source: &Path, err: &walkdir::Error) {
    let is_dir_failure = err
        .path()
        .map(|p| p.is_dir())
        .unwrap_or(true);
    let key = err
        .path()
        .and_then(|p| key_from_relative(source, p).ok());

    match key {
        Some(key) if !is_dir_failure => {
            result.errors.push(FileError::new(&key, err));
            result.failed_keys.push(key);
        }
        Some(key) => {
            result.errors.push(FileError::new(&key, err));
            result.incomplete = true;
        }
        None => {
            result
                .errors
                .push(FileError::new(source.display().to_string(), err));
            result.incomplete = true;
        }
    }
}
