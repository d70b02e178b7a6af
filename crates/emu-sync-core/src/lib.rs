//! Synchronization engine for emu-sync
//!
//! An administrator publishes a tree of ROM and BIOS files to an
//! S3-compatible bucket together with a manifest of every file's size and
//! MD5. Recipient devices compare that manifest with a local copy and
//! transfer only the difference.
//!
//! - **Manifest**: snapshot model and the pure three-way diff
//! - **Upload**: scan, hash with a persistent cache, push changes, publish
//! - **Sync**: fetch, filter, diff, heal drift, download atomically, delete or retain
//! - **Verify**: re-hash local files and forget the ones that drifted
//!
//! # Architecture
//!
//! ```text
//!              caller (CLI, service, UI)
//!                        |
//!        Uploader / SyncEngine / verify
//!                        |
//!     +--------+-------+-+------+---------+----------+
//!     |        |       |        |         |          |
//!  manifest  cache   pool    retry    ratelimit   lock
//!                        |
//!                 storage::Backend
//!                        |
//!                   emu-sync-fs
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use emu_sync_core::{DirectoryBackend, FileRunLock, StatePaths, SyncEngine, SyncOptions};
//!
//! let state = StatePaths::default_for_user()?;
//! let engine = SyncEngine::new(
//!     Arc::new(DirectoryBackend::new("/mnt/bucket")),
//!     Arc::new(FileRunLock::new(&state.lock_file)),
//! );
//! let report = engine.run(&SyncOptions::new("/home/deck/Emulation", &state.local_manifest))?;
//! println!("{}", report.summary());
//! ```

pub mod cache;
pub mod cancel;
pub mod config;
pub mod error;
pub mod lock;
pub mod logging;
pub mod manifest;
pub mod pool;
pub mod progress;
pub mod ratelimit;
pub mod retry;
pub mod storage;
pub mod sync;
pub mod upload;

pub use cache::{CacheEntry, HashCache};
pub use cancel::CancelToken;
pub use config::{StatePaths, SyncSelection, parse_byte_size};
pub use error::{Error, FileError, Result};
pub use lock::{FileRunLock, HeldLock, NoopRunLock, RunLock};
pub use manifest::{DiffResult, FileEntry, Manifest, diff};
pub use progress::{DoneCounts, JsonLinesSink, MemorySink, ProgressEvent, ProgressReporter, ProgressSink};
pub use ratelimit::RateLimiter;
pub use retry::{RetryError, RetryPolicy, with_backoff};
pub use storage::{Backend, DirectoryBackend, MANIFEST_KEY, MemoryBackend, StorageError};
pub use sync::{SyncEngine, SyncOptions, SyncReport, VerifyReport, verify};
pub use upload::{UploadOptions, UploadReport, Uploader};
