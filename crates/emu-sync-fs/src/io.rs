//! Atomic I/O operations

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use crate::{Error, Result};

/// Sibling path used while `path` is being written.
///
/// Lives in the same directory so the final rename never crosses
/// filesystems.
pub fn temp_sibling(path: &Path) -> PathBuf {
    let temp_name = format!(
        ".{}.{}.tmp",
        path.file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default(),
        std::process::id()
    );
    path.with_file_name(temp_name)
}

/// Write content atomically to a file.
///
/// Uses write-to-temp-then-rename so a crash mid-write leaves either the
/// previous content or the new content at `path`, never a mix.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    write_atomic_from(path, content).map(|_| ())
}

/// Stream `reader` into `path` atomically, returning the bytes written.
pub fn write_atomic_from<R: Read>(path: &Path, reader: R) -> Result<u64> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
    }

    let temp_path = temp_sibling(path);
    match stream_to(&temp_path, reader) {
        Ok(written) => {
            if let Err(e) = fs::rename(&temp_path, path) {
                let _ = fs::remove_file(&temp_path);
                return Err(Error::io(path, e));
            }
            Ok(written)
        }
        Err(e) => {
            let _ = fs::remove_file(&temp_path);
            Err(e)
        }
    }
}

/// Create (or truncate) `path` and copy `reader` into it, flushing to disk.
///
/// This is not atomic on its own; callers rename the result into place.
pub fn stream_to<R: Read>(path: &Path, mut reader: R) -> Result<u64> {
    let mut file = create_replacing(path)?;
    let written = io::copy(&mut reader, &mut file).map_err(|e| Error::io(path, e))?;
    file.flush().map_err(|e| Error::io(path, e))?;
    file.sync_all().map_err(|e| Error::io(path, e))?;
    Ok(written)
}

/// Open `path` for writing, replacing a file we cannot truncate.
///
/// A file owned by another user in a shared group directory cannot be
/// opened for writing, but directory write permission is enough to unlink it.
fn create_replacing(path: &Path) -> Result<File> {
    let open = || {
        OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
    };
    match open() {
        Ok(file) => Ok(file),
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            let _ = fs::remove_file(path);
            open().map_err(|e| Error::io(path, e))
        }
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Remove a file, treating "already gone" as success.
///
/// Returns whether a file was actually removed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Read a whole file into memory.
pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::io(path, e))
}
