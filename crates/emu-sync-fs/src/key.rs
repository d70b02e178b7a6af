//! Object keys: forward-slash, root-relative file identifiers
//!
//! A key is the name a file has in a manifest and in the bucket. Keys never
//! carry platform separators, so they are converted to native paths only at
//! I/O boundaries.

use std::ffi::OsStr;
use std::path::{Component, Path, PathBuf};

use crate::{Error, Result};

/// Check that `key` is a normalized, root-relative object key.
///
/// Rejects empty keys, backslashes, a leading slash, and empty, `.` or `..`
/// segments. Anything accepted here resolves to a path strictly inside the
/// sync root.
pub fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::invalid_key(key, "key is empty"));
    }
    if key.contains('\\') {
        return Err(Error::invalid_key(key, "contains a backslash"));
    }
    if key.starts_with('/') {
        return Err(Error::invalid_key(key, "has a leading slash"));
    }
    for segment in key.split('/') {
        match segment {
            "" => return Err(Error::invalid_key(key, "contains an empty segment")),
            "." | ".." => return Err(Error::invalid_key(key, "contains a relative segment")),
            _ => {}
        }
    }
    Ok(())
}

/// Build the object key for `path`, which must live under `root`.
pub fn key_from_relative(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| Error::OutsideRoot {
        path: path.to_path_buf(),
        root: root.to_path_buf(),
    })?;

    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| {
                    Error::invalid_key(relative.to_string_lossy(), "not valid UTF-8")
                })?;
                segments.push(part);
            }
            Component::CurDir => {}
            _ => {
                return Err(Error::invalid_key(
                    relative.to_string_lossy(),
                    "not a plain relative path",
                ));
            }
        }
    }

    let key = segments.join("/");
    validate_key(&key)?;
    Ok(key)
}

/// Resolve a validated key to its native path under `root`.
pub fn key_to_path(root: &Path, key: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    path.extend(key.split('/'));
    path
}

/// True for dotfile names such as `.DS_Store` or `.git`.
pub fn is_hidden(name: &OsStr) -> bool {
    name.to_str().is_some_and(|n| n.starts_with('.'))
}
