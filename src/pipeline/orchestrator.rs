//! Orchestrator: wire the stages, run the scanner, drain, and wind down.
//!
//! Channel closure order is what shuts the pipeline off cleanly: the scanner
//! drops the hasher input when the walk ends; once the in-flight counter
//! drains the orchestrator retires the session's bucketer sender (nothing can
//! revive work after a drain), the bucketer flushes its tail and exits, its
//! batch sender drops, and the uploaders run dry.

use anyhow::{Result, anyhow};
use crossbeam_channel::bounded;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::storage::ServiceFactory;
use crate::types::{Batch, HashPlan, Planned};
use crate::utils::config::ChannelCaps;

use super::bucketer::spawn_bucketer;
use super::hasher::spawn_hashers;
use super::scanner::run_scanner;
use super::session::BackupSession;
use super::uploader::spawn_uploaders;

/// Final counters for one run, read off the session stats.
#[derive(Clone, Copy, Debug, Default)]
pub struct RunSummary {
    pub scanned: u64,
    pub unchanged: u64,
    pub uploaded_entries: u64,
    pub uploaded_bytes: u64,
    pub blobs: u64,
    pub deduped: u64,
    pub pruned: u64,
}

/// Run one backup over `roots`. Returns once every worker has exited cleanly.
pub fn run_backup(
    session: Arc<BackupSession>,
    roots: &[PathBuf],
    factory: &ServiceFactory,
) -> Result<RunSummary> {
    assert!(
        session.settings.num_hasher_threads >= 1 && session.settings.num_uploader_threads >= 1,
        "worker pools need at least one thread each"
    );

    let (hash_tx, hash_rx) = bounded::<HashPlan>(ChannelCaps::HASH_PLANS);
    let (plan_tx, plan_rx) = bounded::<Planned>(ChannelCaps::PLANS);
    let (batch_tx, batch_rx) = bounded::<Batch>(ChannelCaps::BATCHES);
    session.install_plan_sender(plan_tx);

    let hasher_handles = spawn_hashers(&session, hash_rx);
    let bucketer_handle = spawn_bucketer(&session, plan_rx, batch_tx);
    let uploader_handles = match spawn_uploaders(&session, batch_rx, factory) {
        Ok(handles) => handles,
        Err(e) => {
            // Let the already-spawned stages run dry before reporting.
            session.retire_plan_sender();
            drop(hash_tx);
            return Err(e);
        }
    };
    let status = StatusHeartbeat::start(&session);

    let scan_result = run_scanner(&session, roots, hash_tx);

    // The drain has finished (or the scanner failed early; its error is
    // checked below either way). Retiring the bucketer sender lets the
    // stages run dry in order.
    session.retire_plan_sender();

    for handle in hasher_handles {
        join_worker(handle, "hasher")?;
    }
    join_worker(bucketer_handle, "bucketer")?;
    for handle in uploader_handles {
        join_worker(handle, "uploader")?;
    }
    status.stop();

    scan_result?;
    if let Some(msg) = session.take_error() {
        return Err(anyhow!(msg));
    }

    assert_eq!(session.inflight.current(), 0, "in-flight work after drain");
    assert!(
        session.claims.is_empty(),
        "size claims outstanding after run"
    );
    assert!(
        session.late.lock().is_empty(),
        "hash-late entries outstanding after run"
    );

    let summary = summarize(&session);
    info!(
        "backup complete: {} scanned, {} unchanged, {} entries in {} blobs ({} bytes), {} deduped, {} pruned",
        summary.scanned,
        summary.unchanged,
        summary.uploaded_entries,
        summary.blobs,
        summary.uploaded_bytes,
        summary.deduped,
        summary.pruned,
    );
    Ok(summary)
}

fn join_worker(handle: JoinHandle<()>, stage: &str) -> Result<()> {
    handle
        .join()
        .map_err(|_| anyhow!("{stage} worker panicked"))
}

fn summarize(session: &BackupSession) -> RunSummary {
    use std::sync::atomic::Ordering::Relaxed;
    let stats = &session.stats;
    RunSummary {
        scanned: stats.scanned.load(Relaxed),
        unchanged: stats.unchanged.load(Relaxed),
        uploaded_entries: stats.uploaded_entries.load(Relaxed),
        uploaded_bytes: stats.uploaded_bytes.load(Relaxed),
        blobs: stats.blobs.load(Relaxed),
        deduped: stats.deduped.load(Relaxed),
        pruned: stats.pruned.load(Relaxed),
    }
}

/// Periodic status logging, disabled when the configured interval is
/// negative.
struct StatusHeartbeat {
    stop: Option<(Arc<AtomicBool>, JoinHandle<()>)>,
}

impl StatusHeartbeat {
    fn start(session: &Arc<BackupSession>) -> Self {
        let interval = session.settings.upload_status_interval_seconds;
        if interval < 0 {
            return Self { stop: None };
        }
        let interval = Duration::from_secs(interval.max(1) as u64);
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let session = Arc::clone(session);
        let handle = thread::spawn(move || {
            // Short ticks so stop() never waits out a full interval.
            let tick = Duration::from_millis(200);
            let mut elapsed = Duration::ZERO;
            while !stop_flag.load(Ordering::Relaxed) {
                thread::sleep(tick);
                elapsed += tick;
                if elapsed >= interval {
                    elapsed = Duration::ZERO;
                    info!("{}", session.stats.status_line());
                }
            }
        });
        Self {
            stop: Some((stop, handle)),
        }
    }

    fn stop(self) {
        if let Some((stop, handle)) = self.stop {
            stop.store(true, Ordering::Relaxed);
            if handle.join().is_err() {
                debug!("status heartbeat thread panicked");
            }
        }
    }
}
