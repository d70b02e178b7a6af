//! MD5 content hashes
//!
//! The manifest identifies file content by the lower-case hex MD5 digest of
//! its bytes. Hashes depend on content only, never on name or mtime.

use md5::{Digest, Md5};
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use crate::{Error, Result};

/// Compute the content hash of an in-memory buffer.
pub fn hash_bytes(data: &[u8]) -> String {
    let mut hasher = Md5::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Compute the content hash of everything `reader` yields.
///
/// The input is streamed into the hasher, so arbitrarily large files are
/// never held in memory.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Md5::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Compute the content hash of a file on disk.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or read.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).map_err(|e| Error::io(path, e))?;
    hash_reader(file).map_err(|e| Error::io(path, e))
}
