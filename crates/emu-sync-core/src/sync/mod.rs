//! Recipient-side synchronization
//!
//! This module provides:
//! - **engine**: bring a local tree in line with the published manifest
//! - **status**: report what the next sync would change, touching nothing
//! - **verify**: re-check files on disk and forget the ones that drifted

mod engine;
mod verify;

pub use engine::{SyncEngine, SyncOptions, SyncReport};
pub use verify::{VerifyReport, verify};
