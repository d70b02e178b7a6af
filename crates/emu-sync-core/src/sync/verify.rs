//! Local verification
//!
//! Re-checks each file recorded in the local manifest against disk. Files
//! that are missing or differ are dropped from the manifest so the next
//! sync fetches them again.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::FileError;
use crate::manifest::Manifest;
use crate::{Error, Result};
use emu_sync_fs::{checksum, key_to_path};

/// Outcome of a verify pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyReport {
    /// Files matching their recorded size and hash
    pub ok: Vec<String>,
    /// Files whose size or hash differs
    pub mismatch: Vec<String>,
    /// Files recorded but absent from disk
    pub missing: Vec<String>,
    /// Files that could not be checked; their entries are kept
    pub errors: Vec<FileError>,
}

impl VerifyReport {
    /// True when every recorded file matched
    pub fn is_clean(&self) -> bool {
        self.mismatch.is_empty() && self.missing.is_empty() && self.errors.is_empty()
    }

    pub fn summary(&self) -> String {
        let mut out = format!("Verified: {} files OK\n", self.ok.len());
        if !self.mismatch.is_empty() {
            out.push_str(&format!(
                "Mismatched: {} files (will re-download on next sync)\n",
                self.mismatch.len()
            ));
            for key in &self.mismatch {
                out.push_str(&format!("  ~ {key}\n"));
            }
        }
        if !self.missing.is_empty() {
            out.push_str(&format!(
                "Missing: {} files (will re-download on next sync)\n",
                self.missing.len()
            ));
            for key in &self.missing {
                out.push_str(&format!("  - {key}\n"));
            }
        }
        if !self.errors.is_empty() {
            out.push_str(&format!("Errors: {}\n", self.errors.len()));
            for err in &self.errors {
                out.push_str(&format!("  ! {err}\n"));
            }
        }
        if self.is_clean() {
            out.push_str("All files match the manifest.\n");
        }
        out
    }
}

enum Check {
    Ok,
    Mismatch,
    Missing,
}

/// Verify the tree under `root` against the manifest at `local_manifest`.
///
/// # Errors
///
/// Returns [`Error::LocalManifestMissing`] if there is no local manifest,
/// or an error if it cannot be read or rewritten.
pub fn verify(root: &Path, local_manifest: &Path) -> Result<VerifyReport> {
    verify_with(root, local_manifest, checksum::hash_file)
}

/// [`verify`] with the content hasher supplied by the caller
pub(crate) fn verify_with<H>(root: &Path, local_manifest: &Path, hash: H) -> Result<VerifyReport>
where
    H: Fn(&Path) -> emu_sync_fs::Result<String>,
{
    let mut manifest = match Manifest::load_from_disk(local_manifest) {
        Ok(manifest) => manifest,
        Err(Error::Fs(e)) if e.is_not_found() => {
            return Err(Error::LocalManifestMissing {
                path: local_manifest.to_path_buf(),
            });
        }
        Err(e) => return Err(e),
    };

    let mut report = VerifyReport::default();
    for (key, entry) in &manifest.files {
        let path = key_to_path(root, key);
        match check_file(&path, entry.size, &entry.content_hash, &hash) {
            Ok(Check::Ok) => report.ok.push(key.clone()),
            Ok(Check::Mismatch) => {
                debug!(key = %key, "content differs from manifest");
                report.mismatch.push(key.clone());
            }
            Ok(Check::Missing) => {
                debug!(key = %key, "missing from disk");
                report.missing.push(key.clone());
            }
            Err(e) => {
                warn!(key = %key, error = %e, "could not verify");
                report.errors.push(FileError::new(key, &e));
            }
        }
    }

    let dropped = report.mismatch.len() + report.missing.len();
    if dropped > 0 {
        for key in report.mismatch.iter().chain(&report.missing) {
            manifest.remove(key);
        }
        manifest.save_to_disk(local_manifest)?;
        info!(dropped, "removed drifted entries from local manifest");
    }

    Ok(report)
}

fn check_file<H>(path: &Path, size: i64, content_hash: &str, hash: &H) -> Result<Check>
where
    H: Fn(&Path) -> emu_sync_fs::Result<String>,
{
    let meta = match fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Check::Missing),
        Err(e) => return Err(emu_sync_fs::Error::io(path, e).into()),
    };
    if !meta.is_file() || i64::try_from(meta.len()).ok() != Some(size) {
        return Ok(Check::Mismatch);
    }

    match hash(path) {
        Ok(actual) if actual == content_hash => Ok(Check::Ok),
        Ok(_) => Ok(Check::Mismatch),
        Err(e) if e.is_not_found() => Ok(Check::Missing),
        Err(e) => Err(e.into()),
    }
}
