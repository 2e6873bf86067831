//! Hasher pool: read files whose content identity the scanner could not
//! decide, and route them by hash.
//!
//! Ordering matters in here: the size-claim wait must come before the
//! hash-late decision, so that by the time we choose whether to upload, any
//! staker of our size has committed its transaction. The hash-late guard is
//! then held across the catalog check and, on the already-stored path, the
//! file-row commit.

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use log::{debug, warn};
use sha2::{Digest, Sha256};
use std::io::Read;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::catalog::CatalogConn;
use crate::types::{ContentHash, FileRecord, HashPlan, Planned};
use crate::utils::config::HashingConsts;

use super::latecomers::LateDecision;
use super::session::{BackupSession, RunStats};

/// Spawn the hasher pool. Each worker owns a catalog connection; all of them
/// share the hash-plan receiver.
pub fn spawn_hashers(
    session: &Arc<BackupSession>,
    hash_rx: Receiver<HashPlan>,
) -> Vec<JoinHandle<()>> {
    (0..session.settings.num_hasher_threads)
        .map(|_| {
            let session = Arc::clone(session);
            let hash_rx = hash_rx.clone();
            thread::spawn(move || hasher_worker_loop(&session, hash_rx))
        })
        .collect()
}

/// One worker: process plans until the channel closes. After a fatal error
/// the worker keeps draining so the scanner's drain wait cannot hang, but
/// drops every remaining plan.
fn hasher_worker_loop(session: &Arc<BackupSession>, hash_rx: Receiver<HashPlan>) {
    let conn = match session.catalog.connect() {
        Ok(conn) => conn,
        Err(e) => {
            session.record_error(format!("hasher could not open catalog: {e:#}"));
            while hash_rx.recv().is_ok() {
                session.inflight.sub(1);
            }
            return;
        }
    };
    while let Ok(plan) = hash_rx.recv() {
        if session.has_error() {
            session.inflight.sub(1);
            continue;
        }
        if let Err(e) = process_hash_plan(session, &conn, plan) {
            session.record_error(format!("hasher: {e:#}"));
        }
    }
}

/// The scanner's in-flight unit for one plan. Consumed on drop unless the
/// plan was forwarded to the bucketer, in which case the unit rides along to
/// the uploader.
struct PlanUnit<'s> {
    session: &'s BackupSession,
    forwarded: bool,
}

impl<'s> PlanUnit<'s> {
    fn new(session: &'s BackupSession) -> Self {
        Self {
            session,
            forwarded: false,
        }
    }

    fn forward(mut self) {
        self.forwarded = true;
    }
}

impl Drop for PlanUnit<'_> {
    fn drop(&mut self) {
        if !self.forwarded {
            self.session.inflight.sub(1);
        }
    }
}

/// Hash one file and decide its fate.
fn process_hash_plan(
    session: &Arc<BackupSession>,
    conn: &CatalogConn,
    plan: HashPlan,
) -> Result<()> {
    let HashPlan {
        file,
        expected_hash,
    } = plan;
    let unit = PlanUnit::new(session);

    let (hash, observed_size) = match hash_file(session, &file) {
        Ok(v) => v,
        Err(e) => {
            if session.settings.skip_hash_failures {
                warn!("skipping unreadable file {}: {e:#}", file.path.display());
                return Ok(());
            }
            return Err(e.context(format!("hash {}", file.path.display())));
        }
    };
    RunStats::bump(&session.stats.hashed);

    if observed_size != file.info.size {
        // The uploader re-reads and re-hashes, so this is survivable.
        warn!(
            "{} changed size while hashing ({} -> {} bytes)",
            file.path.display(),
            file.info.size,
            observed_size
        );
    }

    // If a staker holds our size, its blob must commit before we can trust
    // the catalog's view of this hash.
    if session.claims.wait_then_release(file.info.size) {
        debug!(
            "resumed after size claim {} released ({})",
            file.info.size,
            file.path.display()
        );
    }

    if expected_hash == Some(hash) {
        // Same content as the current row; only metadata moved.
        conn.begin()?;
        conn.touch_current(&file.path, file.info.fs_modified, file.info.permissions)
            .with_context(|| format!("touch {}", file.path.display()))?;
        conn.commit()?;
        return Ok(());
    }

    let mut late = session.late.lock();
    let stored = conn.hash_is_stored(&hash)?;
    match late.record_latecomer_or_claim(hash, file.clone(), stored) {
        LateDecision::AlreadyStored => {
            // Commit under the guard so no uploader can interleave.
            conn.begin()?;
            conn.end_current_and_insert(
                &file.path,
                &hash,
                file.info.fs_modified,
                file.info.permissions,
                session.now,
            )
            .with_context(|| format!("record deduped file {}", file.path.display()))?;
            conn.commit()?;
            drop(late);
            RunStats::bump(&session.stats.deduped);
        }
        LateDecision::Latecomer => {
            drop(late);
            debug!(
                "{} queued behind in-flight upload of {}",
                file.path.display(),
                hex::encode(hash)
            );
            RunStats::bump(&session.stats.deduped);
        }
        LateDecision::FirstClaim => {
            drop(late);
            let confirmed_size = observed_size;
            if !session.send_plan(Planned::Hashed {
                file,
                hash,
                confirmed_size,
            }) {
                anyhow::bail!("bucketer channel closed while hashing");
            }
            unit.forward();
        }
    }
    Ok(())
}

/// Hash a file through the session's opener with SHA-256, chunked reads.
/// Returns the hash and the byte count actually read.
fn hash_file(session: &Arc<BackupSession>, file: &FileRecord) -> Result<(ContentHash, u64)> {
    let mut reader = session
        .opener
        .open(&file.path)
        .with_context(|| format!("open {}", file.path.display()))?;
    let mut hasher = Sha256::new();
    let mut observed = 0u64;
    let mut chunk = vec![0u8; HashingConsts::HASH_READ_CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).context("read for hashing")?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        observed += n as u64;
    }
    Ok((hasher.finalize().into(), observed))
}
