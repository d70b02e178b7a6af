//! Shared test utilities for the emu-sync workspace.
//!
//! Dev-dependency only, never published.
//!
//! # Modules
//!
//! - [`tree`]: [`TestTree`], a scratch sync root with its own state and bucket directories
//! - [`manifest`]: [`ManifestBuilder`] for manifest JSON fixtures

pub mod manifest;
pub mod tree;

pub use manifest::ManifestBuilder;
pub use tree::TestTree;
