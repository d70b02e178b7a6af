//! Per-invocation configuration values
//!
//! Everything the engines need is passed in explicitly; nothing here is
//! global. Loading these values from a config file is the caller's job.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{Error, Result};
use emu_sync_fs::StateFile;

/// Directory name used under the per-user data directory
pub const APP_DIR: &str = "emu-sync";

/// Directories synced when the configuration names none
pub const DEFAULT_SYNC_DIRS: [&str; 2] = ["roms", "bios"];

/// Locations of per-device state, kept outside the synced tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatePaths {
    pub local_manifest: PathBuf,
    pub upload_cache: PathBuf,
    pub lock_file: PathBuf,
}

impl StatePaths {
    /// Root all state files in `dir`
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            local_manifest: dir.join(StateFile::LocalManifest),
            upload_cache: dir.join(StateFile::UploadCache),
            lock_file: dir.join(StateFile::SyncLock),
        }
    }

    /// The OS-convention per-user location, e.g. `~/.local/share/emu-sync`
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoDataDir`] if the platform has no such directory.
    pub fn default_for_user() -> Result<Self> {
        let base = dirs::data_dir().ok_or(Error::NoDataDir)?;
        Ok(Self::in_dir(base.join(APP_DIR)))
    }
}

/// Which remote keys this device syncs
///
/// A key is selected when it equals an entry of `dirs` or lies beneath one,
/// and is not listed in `exclude`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSelection {
    pub dirs: Vec<String>,
    #[serde(default)]
    pub exclude: BTreeSet<String>,
}

impl Default for SyncSelection {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_DIRS)
    }
}

impl SyncSelection {
    pub fn new<I, S>(dirs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            dirs: dirs
                .into_iter()
                .map(|d| d.into().trim_matches('/').to_string())
                .filter(|d| !d.is_empty())
                .collect(),
            exclude: BTreeSet::new(),
        }
    }

    /// Select every key
    pub fn everything() -> Self {
        Self {
            dirs: vec![String::new()],
            exclude: BTreeSet::new(),
        }
    }

    pub fn with_exclude<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Should `key` be synced to this device?
    pub fn should_sync(&self, key: &str) -> bool {
        if self.exclude.contains(key) {
            return false;
        }
        self.dirs.iter().any(|dir| {
            dir.is_empty()
                || key == dir
                || key
                    .strip_prefix(dir.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// Parse a human-readable byte count such as `"10MB"`, `"512k"` or `"1.5G"`.
///
/// Units are binary multiples and case-insensitive; a bare number is bytes.
/// An empty string parses as zero, meaning "unset".
pub fn parse_byte_size(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let invalid = |reason: &str| Error::InvalidSize {
        input: input.to_string(),
        reason: reason.to_string(),
    };

    let value: f64 = number.parse().map_err(|_| invalid("not a number"))?;
    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1 << 10,
        "M" | "MB" | "MIB" => 1 << 20,
        "G" | "GB" | "GIB" => 1 << 30,
        _ => return Err(invalid("unknown unit")),
    };

    let bytes = value * multiplier as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(invalid("too large"));
    }
    Ok(bytes as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn default_selection_covers_roms_and_bios() {
        let selection = SyncSelection::default();
        assert!(selection.should_sync("roms/snes/Game.sfc"));
        assert!(selection.should_sync("bios/scph1001.bin"));
        assert!(!selection.should_sync("saves/game.srm"));
        assert!(!selection.should_sync("romsextra/file"));
    }

    #[test]
    fn exact_file_entries_and_excludes() {
        let selection = SyncSelection::new(["roms/snes", "roms/gba/Metroid.gba"])
            .with_exclude(["roms/snes/Bad.sfc"]);
        assert!(selection.should_sync("roms/snes/Good.sfc"));
        assert!(!selection.should_sync("roms/snes/Bad.sfc"));
        assert!(selection.should_sync("roms/gba/Metroid.gba"));
        assert!(!selection.should_sync("roms/gba/Other.gba"));
    }

    #[test]
    fn everything_selects_all_keys() {
        assert!(SyncSelection::everything().should_sync("anything/at/all"));
    }

    #[test]
    fn trailing_slashes_are_ignored() {
        assert!(SyncSelection::new(["roms/"]).should_sync("roms/a.bin"));
    }

    #[test]
    fn state_paths_share_a_directory() {
        let paths = StatePaths::in_dir("/state");
        assert_eq!(paths.local_manifest, Path::new("/state/local-manifest.json"));
        assert_eq!(paths.upload_cache, Path::new("/state/upload-cache.json"));
        assert_eq!(paths.lock_file, Path::new("/state/sync.lock"));
    }

    #[rstest]
    #[case("", 0)]
    #[case("1024", 1024)]
    #[case("10MB", 10 * 1024 * 1024)]
    #[case("10mb", 10 * 1024 * 1024)]
    #[case("512K", 512 * 1024)]
    #[case("1.5G", 3 * 512 * 1024 * 1024)]
    #[case("50 MiB", 50 * 1024 * 1024)]
    fn parses_sizes(#[case] input: &str, #[case] expected: u64) {
        assert_eq!(parse_byte_size(input).unwrap(), expected);
    }

    #[rstest]
    #[case("fast")]
    #[case("10XB")]
    #[case("1.2.3M")]
    fn rejects_bad_sizes(#[case] input: &str) {
        assert!(parse_byte_size(input).is_err());
    }
}
