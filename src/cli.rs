//! Command-line surface: argument parsing and the backup handler.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;

use crate::types::Settings;
use crate::utils::burrow_toml::{apply_file_to_settings, load_burrow_toml};
use crate::utils::config::PackagePaths;
use crate::utils::setup_logging;

/// Content-addressed, encrypted, deduplicating backup.
#[derive(Clone, Parser)]
#[command(name = "burrow")]
#[command(about = "Back up files and directories into encrypted blobs plus a SQLite catalog.")]
pub struct Cli {
    /// Roots to back up (regular files or directories).
    #[arg(value_name = "ROOT", required = true)]
    pub roots: Vec<PathBuf>,

    /// Catalog database path. Default: `.burrow.db` in the working directory.
    #[arg(long, short)]
    pub catalog: Option<PathBuf>,

    /// Storage destination directory. Repeat for replication.
    #[arg(long, short, num_args = 1..)]
    pub storage: Vec<PathBuf>,

    /// Verbose output. Default: false.
    #[arg(long, short = 'v')]
    pub verbose: bool,

    /// Hasher worker threads. Default: from config file or 2.
    #[arg(long)]
    pub hashers: Option<usize>,

    /// Uploader worker threads. Default: from config file or 2.
    #[arg(long)]
    pub uploaders: Option<usize>,

    /// Path prefixes to exclude (case-insensitive, with trailing separator).
    #[arg(long, num_args = 1..)]
    pub exclude_prefix: Vec<String>,

    /// Path suffixes to exclude (case-insensitive), e.g. `.tmp`.
    #[arg(long, num_args = 1..)]
    pub exclude_suffix: Vec<String>,

    /// Log and skip files that cannot be read while hashing, instead of
    /// failing the run.
    #[arg(long)]
    pub skip_hash_failures: bool,
}

/// Resolve settings and paths (file config first, CLI flags win) and run the
/// backup.
pub fn handle_backup(cli: &Cli) -> Result<()> {
    setup_logging(cli.verbose);

    let mut settings = Settings::default();
    let mut catalog = cli.catalog.clone();
    let mut storage = cli.storage.clone();
    let cwd = std::env::current_dir().context("resolve working directory")?;
    if let Some(file) = load_burrow_toml(&cwd) {
        apply_file_to_settings(&file, &mut settings, &mut catalog, &mut storage);
    }

    if let Some(n) = cli.hashers {
        settings.num_hasher_threads = n;
    }
    if let Some(n) = cli.uploaders {
        settings.num_uploader_threads = n;
    }
    settings
        .exclude_prefixes
        .extend(cli.exclude_prefix.iter().cloned());
    settings
        .exclude_suffixes
        .extend(cli.exclude_suffix.iter().cloned());
    if cli.skip_hash_failures {
        settings.skip_hash_failures = true;
    }

    if settings.num_hasher_threads < 1 || settings.num_uploader_threads < 1 {
        bail!("worker thread counts must be at least 1");
    }
    if storage.is_empty() {
        bail!("no storage destination; pass --storage DIR or set one in the config file");
    }
    let catalog = catalog.unwrap_or_else(|| cwd.join(PackagePaths::get().catalog_filename()));

    crate::back_up(&cli.roots, &catalog, &storage, settings)?;
    Ok(())
}
