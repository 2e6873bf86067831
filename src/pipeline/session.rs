//! Backup session: the shared state every pipeline worker holds a handle to.
//!
//! One `BackupSession` spans one run. It owns the coordination maps, the
//! in-flight work counter, run statistics, the run timestamp, and the
//! bucketer's input sender. Workers receive it as an `Arc`; tests construct
//! their own session with an injected walker, file opener, catalog, and
//! upload service.

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::catalog::Catalog;
use crate::fswalk::{FileOpener, Walker};
use crate::types::{Planned, Settings};

use super::claims::SizeClaimMap;
use super::latecomers::HashLateMap;

/// Count of work items the pipeline still owes. The scanner adds one unit per
/// plan it enqueues (staked or hash), the uploader adds one per revived
/// latecomer; units are consumed by the hasher (when it does not forward to
/// the bucketer) or by the uploader (one per batch entry, committed or
/// dropped). The scanner's drain wait blocks until the count returns to zero.
#[derive(Default)]
pub struct InflightCounter {
    count: Mutex<u64>,
    zero: Condvar,
}

impl InflightCounter {
    pub fn add(&self, n: u64) {
        let mut count = self.count.lock().unwrap();
        *count += n;
    }

    pub fn sub(&self, n: u64) {
        let mut count = self.count.lock().unwrap();
        assert!(*count >= n, "in-flight counter underflow");
        *count -= n;
        if *count == 0 {
            self.zero.notify_all();
        }
    }

    pub fn wait_zero(&self) {
        let mut count = self.count.lock().unwrap();
        while *count > 0 {
            count = self.zero.wait(count).unwrap();
        }
    }

    pub fn current(&self) -> u64 {
        *self.count.lock().unwrap()
    }
}

/// Run counters for status lines and the final summary.
#[derive(Default)]
pub struct RunStats {
    pub scanned: AtomicU64,
    pub unchanged: AtomicU64,
    pub staked: AtomicU64,
    pub hashed: AtomicU64,
    pub deduped: AtomicU64,
    pub uploaded_entries: AtomicU64,
    pub uploaded_bytes: AtomicU64,
    pub blobs: AtomicU64,
    pub pruned: AtomicU64,
}

impl RunStats {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.uploaded_bytes.fetch_add(n, Ordering::Relaxed);
    }

    pub fn status_line(&self) -> String {
        format!(
            "scanned {} (unchanged {}), hashed {}, uploaded {} entries / {} bytes in {} blobs, deduped {}",
            self.scanned.load(Ordering::Relaxed),
            self.unchanged.load(Ordering::Relaxed),
            self.hashed.load(Ordering::Relaxed),
            self.uploaded_entries.load(Ordering::Relaxed),
            self.uploaded_bytes.load(Ordering::Relaxed),
            self.blobs.load(Ordering::Relaxed),
            self.deduped.load(Ordering::Relaxed),
        )
    }
}

/// Shared state for one backup run.
pub struct BackupSession {
    pub catalog: Catalog,
    pub settings: Settings,
    /// Sampled once at run start; `start`/`end` for every row this run writes.
    pub now: i64,
    pub claims: SizeClaimMap,
    pub late: HashLateMap,
    pub inflight: InflightCounter,
    pub stats: RunStats,
    pub walker: Box<dyn Walker>,
    pub opener: Box<dyn FileOpener>,
    /// Bucketer input. Scanner, hashers, and uploaders (latecomer revival)
    /// all send through here; the orchestrator retires it after the drain,
    /// which is what lets the bucketer observe channel closure.
    plan_tx: Mutex<Option<Sender<Planned>>>,
    /// First fatal error recorded by any worker; the run fails with it after
    /// the pipeline winds down.
    first_error: Mutex<Option<String>>,
}

impl BackupSession {
    pub fn new(
        catalog: Catalog,
        settings: Settings,
        walker: Box<dyn Walker>,
        opener: Box<dyn FileOpener>,
    ) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before epoch")
            .as_secs() as i64;
        Self {
            catalog,
            settings,
            now,
            claims: SizeClaimMap::new(),
            late: HashLateMap::new(),
            inflight: InflightCounter::default(),
            stats: RunStats::default(),
            walker,
            opener,
            plan_tx: Mutex::new(None),
            first_error: Mutex::new(None),
        }
    }

    pub(crate) fn install_plan_sender(&self, tx: Sender<Planned>) {
        *self.plan_tx.lock().unwrap() = Some(tx);
    }

    /// Drop the bucketer input sender so the channel can close. Called by the
    /// orchestrator once the in-flight count has drained; no revival can
    /// arrive after that.
    pub(crate) fn retire_plan_sender(&self) {
        *self.plan_tx.lock().unwrap() = None;
    }

    /// Send a planned item to the bucketer. Returns false when the sender has
    /// been retired or the bucketer is gone.
    pub fn send_plan(&self, planned: Planned) -> bool {
        let tx = self.plan_tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(planned).is_ok(),
            None => false,
        }
    }

    /// Record a fatal condition. The first one wins and becomes the run's
    /// error; workers switch to drain mode after recording.
    pub fn record_error(&self, msg: String) {
        log::error!("{}", msg);
        self.first_error.lock().unwrap().get_or_insert(msg);
    }

    pub fn take_error(&self) -> Option<String> {
        self.first_error.lock().unwrap().take()
    }

    pub fn has_error(&self) -> bool {
        self.first_error.lock().unwrap().is_some()
    }
}
