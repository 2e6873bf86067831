//! Burrow: content-addressed, encrypted, deduplicating backup.
//!
//! A run walks one or more roots, decides per file whether anything changed
//! since the catalog's current row, hashes only what it must, packs small
//! files into encrypted zstd-compressed blobs, and records every outcome in
//! a SQLite catalog so the next run is incremental and prior states stay
//! recoverable.

pub mod blob;
pub mod catalog;
pub mod cli;
pub mod fswalk;
pub mod pipeline;
pub mod storage;
pub mod types;
pub mod utils;

/// Re-export types for API
pub use types::*;

use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::catalog::Catalog;
use crate::fswalk::{OsFileOpener, OsWalker};
use crate::pipeline::{BackupSession, RunSummary, run_backup};
use crate::storage::{MultiStore, UploadService};

/// Single entry point: back up `roots` into `storage_dirs` against the
/// catalog at `catalog_path`. Creates the catalog on first use. Blobs are
/// replicated to every storage directory.
///
/// For injected walkers, openers, or storage backends, build a
/// [`BackupSession`] and call [`run_backup`] directly.
pub fn back_up(
    roots: &[PathBuf],
    catalog_path: &Path,
    storage_dirs: &[PathBuf],
    settings: Settings,
) -> Result<RunSummary> {
    let session = Arc::new(BackupSession::new(
        Catalog::at(catalog_path),
        settings,
        Box::new(OsWalker),
        Box::new(OsFileOpener),
    ));
    let dirs = storage_dirs.to_vec();
    let factory = move || -> Result<Box<dyn UploadService>> { Ok(Box::new(MultiStore::open(&dirs)?)) };
    run_backup(session, roots, &factory)
}
