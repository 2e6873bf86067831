//! Scanner: walk the roots, diff against the catalog, and plan work.
//!
//! Single task. Unchanged files (same size and mtime as the current catalog
//! row) cost one stat and nothing else. A file whose size has never been
//! stored takes the unique-size fast path: its size is staked in the claim
//! map and the file goes straight to the bucketer unhashed. Everything else
//! becomes a hash plan. After the walk the scanner commits its pulsed
//! transaction, keeps the bucketer flushing via a heartbeat, waits for the
//! pipeline to drain, and finally prunes catalog rows for deleted paths.

use anyhow::{Context, Result, bail};
use crossbeam_channel::Sender;
use log::{debug, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use crate::catalog::{CatalogConn, PulseTx};
use crate::fswalk::file_info_from_metadata;
use crate::types::{FileInfo, FileRecord, HashPlan, Planned, Settings};
use crate::utils::config::TimingConsts;

use super::session::{BackupSession, RunStats};

/// Paths seen during the walk, by catalog key. Drives deletion pruning.
pub type WalkSeen = HashMap<String, FileInfo>;

/// Catalog key for a path (lossy UTF-8; paths are stored as TEXT).
pub fn catalog_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// True when exclusion rules reject the path. Prefixes and suffixes compare
/// case-insensitively; prefixes are expected to carry a trailing separator.
pub fn excluded_by_rules(path: &Path, settings: &Settings) -> bool {
    let lower = path.to_string_lossy().to_lowercase();
    settings
        .exclude_prefixes
        .iter()
        .any(|p| lower.starts_with(&p.to_lowercase()))
        || settings
            .exclude_suffixes
            .iter()
            .any(|s| lower.ends_with(&s.to_lowercase()))
}

/// The catalog database and its WAL sidecars must never back themselves up.
fn is_catalog_file(path: &Path, catalog_path: &Path) -> bool {
    path.to_string_lossy()
        .starts_with(catalog_path.to_string_lossy().as_ref())
}

/// Run the scanner to completion: walk, plan, drain, prune.
pub fn run_scanner(
    session: &Arc<BackupSession>,
    roots: &[PathBuf],
    hash_tx: Sender<HashPlan>,
) -> Result<()> {
    let conn = session.catalog.connect()?;
    let mut seen = WalkSeen::new();

    {
        let mut tx = PulseTx::begin(&conn)?;
        for root in roots {
            walk_root(session, &conn, &mut tx, root, &hash_tx, &mut seen)?;
        }
        drop(hash_tx);
        tx.finish()?;
    }
    debug!("scan complete: {} paths seen", seen.len());

    // The walk is done; from here only the heartbeat feeds the bucketer, so
    // a stalled partial batch always flushes within one interval.
    let heartbeat = FlushHeartbeat::start(Arc::clone(session));
    session.inflight.wait_zero();
    heartbeat.stop();

    prune_deleted(session, &conn, roots, &seen)
}

/// Classify one root and visit its files. A named root that is neither a
/// regular file nor a directory is fatal; during directory walks such
/// entries are silently skipped by the walker.
fn walk_root(
    session: &Arc<BackupSession>,
    conn: &CatalogConn,
    tx: &mut PulseTx<'_>,
    root: &Path,
    hash_tx: &Sender<HashPlan>,
    seen: &mut WalkSeen,
) -> Result<()> {
    let meta = std::fs::symlink_metadata(root)
        .with_context(|| format!("stat root {}", root.display()))?;
    if meta.file_type().is_file() {
        let file = FileRecord {
            path: root.to_path_buf(),
            info: file_info_from_metadata(&meta),
        };
        seen.insert(catalog_key(root), file.info);
        visit_file(session, conn, file, hash_tx)?;
        tx.tick()?;
        return Ok(());
    }
    if !meta.file_type().is_dir() {
        bail!(
            "{} is neither a regular file nor a directory; symlinks and special files are not backed up",
            root.display()
        );
    }

    let catalog_path = session.catalog.path().to_path_buf();
    let mut visit_err = Ok(());
    let result = session.walker.walk(root, &mut |file| {
        if is_catalog_file(&file.path, &catalog_path)
            || excluded_by_rules(&file.path, &session.settings)
        {
            return Ok(());
        }
        seen.insert(catalog_key(&file.path), file.info);
        if let Err(e) = visit_file(session, conn, file, hash_tx) {
            visit_err = Err(e);
            bail!("stop walk");
        }
        tx.tick()
    });
    visit_err?;
    result
}

/// Diff one file against the catalog and emit the right plan.
fn visit_file(
    session: &Arc<BackupSession>,
    conn: &CatalogConn,
    file: FileRecord,
    hash_tx: &Sender<HashPlan>,
) -> Result<()> {
    RunStats::bump(&session.stats.scanned);

    let current = conn.lookup_current(&file.path)?;
    if let Some(cur) = current
        && cur.fs_modified == file.info.fs_modified
        && cur.size == file.info.size
    {
        RunStats::bump(&session.stats.unchanged);
        return Ok(());
    }

    // Unique-size fast path: no stored content of this size and nobody else
    // staking it means this file's content cannot already be in the catalog.
    if conn.any_hash_for_size(file.info.size)?.is_none() && session.claims.stake(file.info.size) {
        RunStats::bump(&session.stats.staked);
        session.inflight.add(1);
        let claim = file.info.size;
        if !session.send_plan(Planned::Staked { file, claim }) {
            session.inflight.sub(1);
            session.claims.release(claim);
            bail!("bucketer channel closed during scan");
        }
        return Ok(());
    }

    let expected_hash = current.map(|c| c.hash);
    session.inflight.add(1);
    if hash_tx
        .send(HashPlan {
            file,
            expected_hash,
        })
        .is_err()
    {
        session.inflight.sub(1);
        bail!("hasher channel closed during scan");
    }
    Ok(())
}

/// End the current row of every cataloged path under each root that the walk
/// did not see. Runs in its own transaction per root, after the pipeline has
/// drained, so it never races file-row writes for the same root.
fn prune_deleted(
    session: &Arc<BackupSession>,
    conn: &CatalogConn,
    roots: &[PathBuf],
    seen: &WalkSeen,
) -> Result<()> {
    for root in roots {
        let prefix = match root.is_dir() {
            true => dir_prefix(root),
            false => root.to_path_buf(),
        };
        conn.begin()?;
        for path in conn.list_current_under(&prefix)? {
            assert!(
                path.starts_with(prefix.to_string_lossy().as_ref()),
                "pruner got {} outside root {}",
                path,
                prefix.display()
            );
            if !seen.contains_key(&path) {
                debug!("pruning deleted path {}", path);
                conn.end_current(Path::new(&path), session.now)?;
                RunStats::bump(&session.stats.pruned);
            }
        }
        conn.commit()?;
    }
    Ok(())
}

/// Directory prefix with a trailing separator, so `/r` never matches `/rx/a`.
fn dir_prefix(root: &Path) -> PathBuf {
    let mut s = root.to_string_lossy().into_owned();
    if !s.ends_with(std::path::MAIN_SEPARATOR) {
        s.push(std::path::MAIN_SEPARATOR);
    }
    PathBuf::from(s)
}

/// Sends a flush sentinel to the bucketer once per interval. Started after
/// the walk finishes; bounded by an explicit stop so it never outlives the
/// drain.
struct FlushHeartbeat {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl FlushHeartbeat {
    fn start(session: Arc<BackupSession>) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let handle = thread::spawn(move || {
            while !stop_flag.load(Ordering::Relaxed) {
                if !session.send_plan(Planned::Flush) {
                    break;
                }
                thread::sleep(TimingConsts::FLUSH_HEARTBEAT);
            }
        });
        Self { stop, handle }
    }

    fn stop(self) {
        self.stop.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            warn!("flush heartbeat thread panicked");
        }
    }
}
