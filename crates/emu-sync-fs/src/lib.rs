//! Filesystem primitives for emu-sync
//!
//! Provides object-key normalization, streamed content hashing and
//! crash-safe atomic writes shared by the upload and sync engines.

pub mod checksum;
pub mod constants;
pub mod error;
pub mod io;
pub mod key;

pub use constants::{StateFile, TEMP_SUFFIX};
pub use error::{Error, Result};
pub use key::{is_hidden, key_from_relative, key_to_path, validate_key};
