use emu_sync_fs::io;
use std::fs;
use std::io::Read;
use tempfile::TempDir;

#[test]
fn test_write_atomic_creates_file_and_parents() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("state").join("nested").join("local-manifest.json");

    io::write_atomic(&path, b"{}").unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "{}");
}

#[test]
fn test_write_atomic_overwrites_existing() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("manifest.json");
    fs::write(&path, "original").unwrap();

    io::write_atomic(&path, b"updated").unwrap();

    assert_eq!(fs::read_to_string(&path).unwrap(), "updated");
}

#[test]
fn test_write_atomic_leaves_no_temp_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("manifest.json");

    io::write_atomic(&path, b"content").unwrap();

    assert!(!io::temp_sibling(&path).exists());
    let entries: Vec<_> = fs::read_dir(temp.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}

struct FailingReader {
    served: bool,
}

impl Read for FailingReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.served {
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "stream dropped",
            ));
        }
        self.served = true;
        let chunk = b"partial";
        buf[..chunk.len()].copy_from_slice(chunk);
        Ok(chunk.len())
    }
}

#[test]
fn test_failed_stream_keeps_previous_content() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("Game.sfc");
    fs::write(&path, "original content").unwrap();

    let result = io::write_atomic_from(&path, FailingReader { served: false });

    assert!(result.is_err());
    assert_eq!(fs::read_to_string(&path).unwrap(), "original content");
    assert!(!io::temp_sibling(&path).exists(), "temp file should be cleaned up");
}

#[test]
fn test_failed_stream_without_previous_file_leaves_nothing() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("Game.sfc");

    let result = io::write_atomic_from(&path, FailingReader { served: false });

    assert!(result.is_err());
    assert!(!path.exists());
}

#[test]
fn test_write_atomic_from_reports_length() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("bios.bin");

    let written = io::write_atomic_from(&path, &b"0123456789"[..]).unwrap();

    assert_eq!(written, 10);
}

#[test]
fn test_remove_if_exists() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("gone.bin");
    fs::write(&path, "x").unwrap();

    assert!(io::remove_if_exists(&path).unwrap());
    assert!(!io::remove_if_exists(&path).unwrap());
}

#[test]
fn test_read_bytes_nonexistent_file() {
    let err = io::read_bytes(std::path::Path::new("/nonexistent/file.bin")).unwrap_err();
    assert!(err.is_not_found());
}
