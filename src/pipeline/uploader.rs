//! Uploader pool: stream one blob per batch through compression, encryption,
//! and a destination service, then commit the catalog rows.
//!
//! Each worker is bound to exactly one `UploadService` for its lifetime. A
//! batch becomes one blob: entries are spooled and encrypted in order, random
//! padding is appended under its own key, the service is finalized, and the
//! whole catalog side (blob, storage, sizes, entries, file rows from
//! hash-late processing) commits as a single transaction under the hash-late
//! mutex. Size claims staked by the scanner are released on every exit path.

use anyhow::{Context, Result};
use crossbeam_channel::Receiver;
use log::{debug, info, warn};
use rand::Rng;
use std::io::Read;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::blob::{BlobWriter, EncryptSlot, random_blob_id, spool_entry};
use crate::catalog::{BlobEntryRow, BlobMeta, CatalogConn, FileRowWrite};
use crate::storage::{ServiceFactory, UploadService};
use crate::types::{Batch, ContentHash, FileRecord, Planned, Settings};
use crate::utils::config::BlobConsts;

use super::latecomers::LateGuard;
use super::scanner::catalog_key;
use super::session::{BackupSession, RunStats};

/// Spawn the uploader pool, pulling one service per worker from the factory.
pub fn spawn_uploaders(
    session: &Arc<BackupSession>,
    batch_rx: Receiver<Batch>,
    factory: &ServiceFactory,
) -> Result<Vec<JoinHandle<()>>> {
    (0..session.settings.num_uploader_threads)
        .map(|_| {
            let service = factory().context("create upload service")?;
            let session = Arc::clone(session);
            let batch_rx = batch_rx.clone();
            Ok(thread::spawn(move || {
                uploader_worker_loop(&session, batch_rx, service)
            }))
        })
        .collect()
}

fn uploader_worker_loop(
    session: &Arc<BackupSession>,
    batch_rx: Receiver<Batch>,
    mut service: Box<dyn UploadService>,
) {
    let conn = match session.catalog.connect() {
        Ok(conn) => conn,
        Err(e) => {
            session.record_error(format!("uploader could not open catalog: {e:#}"));
            while let Ok(batch) = batch_rx.recv() {
                drop(BatchSettlement::new(session, &batch));
            }
            return;
        }
    };
    while let Ok(batch) = batch_rx.recv() {
        if let Err(e) = process_batch(session, &conn, service.as_mut(), batch) {
            session.record_error(format!("uploader: {e:#}"));
        }
    }
}

/// Deferred, unconditional settlement for one batch: every staked claim is
/// released and one in-flight unit is consumed per entry, on success, error,
/// and panic alike.
struct BatchSettlement<'s> {
    session: &'s BackupSession,
    entries: u64,
    staked: Vec<u64>,
}

impl<'s> BatchSettlement<'s> {
    fn new(session: &'s BackupSession, batch: &Batch) -> Self {
        let staked = batch
            .iter()
            .filter_map(|p| match p {
                Planned::Staked { claim, .. } => Some(*claim),
                _ => None,
            })
            .collect();
        Self {
            session,
            entries: batch.len() as u64,
            staked,
        }
    }
}

impl Drop for BatchSettlement<'_> {
    fn drop(&mut self) {
        for claim in self.staked.drain(..) {
            self.session.claims.release(claim);
        }
        self.session.inflight.sub(self.entries);
    }
}

/// Cancels the destination blob on drop unless disarmed. Disarmed right
/// before the catalog commit is attempted: a commit may have succeeded even
/// though the error path is taken afterwards, so the blob is retained from
/// that point on.
struct CancelGuard<'a> {
    service: &'a mut dyn UploadService,
    armed: bool,
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.service.cancel();
        }
    }
}

/// One streamed entry awaiting commit.
struct PendingEntry {
    file: FileRecord,
    /// The hash the plan promised (hashed plans only).
    expected: Option<ContentHash>,
    row: BlobEntryRow,
}

fn process_batch(
    session: &Arc<BackupSession>,
    conn: &CatalogConn,
    service: &mut dyn UploadService,
    batch: Batch,
) -> Result<()> {
    let settlement = BatchSettlement::new(session, &batch);
    if session.has_error() {
        return Ok(());
    }
    let _settlement = settlement;

    let blob_id = random_blob_id();
    let mut cancel = CancelGuard {
        service,
        armed: true,
    };

    // Stream every readable entry into the blob.
    let mut pending: Vec<PendingEntry> = Vec::new();
    let (final_hash, total_size, padding_key) = {
        let mut writer = BlobWriter::begin(&mut *cancel.service, &blob_id)?;
        for plan in batch {
            stream_entry(session, &mut writer, plan, &mut pending)?;
        }
        if pending.is_empty() {
            // Nothing made it in; drop the guard armed so the destination
            // blob is cancelled, and skip the commit.
            debug!("no entries survived; cancelling blob {}", hex::encode(blob_id));
            return Ok(());
        }

        let mut pad_slot = EncryptSlot::fresh();
        let pad_len = padding_len(&session.settings, writer.offset());
        writer.write_padding(&mut pad_slot, pad_len)?;
        let (final_hash, total_size) = writer.finish();
        (final_hash, total_size, pad_slot.key())
    };

    let completions = cancel
        .service
        .end(&final_hash, total_size)
        .context("finalize blob at destinations")?;
    // Commit begins now; whatever happens, the destination blob stays.
    cancel.armed = false;

    commit_batch(
        session,
        conn,
        BlobMeta {
            blob_id,
            padding_key,
            size: total_size,
            final_hash,
        },
        completions,
        pending,
    )
}

/// Pipe one plan's file through the spool and encryption into the blob. Open
/// and read failures skip the entry: a staked plan is simply dropped (its
/// claim settles with the batch), a hashed plan goes through hash-late
/// failure handling so the next waiter gets its turn.
fn stream_entry(
    session: &Arc<BackupSession>,
    writer: &mut BlobWriter<'_>,
    plan: Planned,
    pending: &mut Vec<PendingEntry>,
) -> Result<()> {
    let (file, expected) = match plan {
        Planned::Staked { file, .. } => (file, None),
        Planned::Hashed { file, hash, .. } => (file, Some(hash)),
        Planned::Flush => unreachable!("flush sentinel inside a batch"),
    };

    let spooled = session
        .opener
        .open(&file.path)
        .map_err(anyhow::Error::from)
        .and_then(|mut reader| {
            spool_entry(
                &mut reader,
                &file.path,
                &session.settings.no_compression_exts,
            )
        });
    let spooled = match spooled {
        Ok(spooled) => spooled,
        Err(e) => {
            entry_read_failure(session, &file, expected, &e);
            return Ok(());
        }
    };

    if let Some(expected) = expected
        && expected != spooled.real_hash
    {
        // The file truly has this content now; keep the entry and let the
        // commit phase revive any waiters on the old hash.
        warn!(
            "{} changed between hashing and upload (expected {}, found {})",
            file.path.display(),
            hex::encode(expected),
            hex::encode(spooled.real_hash)
        );
    }

    let offset = writer.offset();
    let mut slot = EncryptSlot::fresh();
    let mut spool = spooled.spool;
    let mut chunk = vec![0u8; BlobConsts::COPY_CHUNK_SIZE];
    loop {
        let n = spool.read(&mut chunk).context("read entry spool")?;
        if n == 0 {
            break;
        }
        writer.write_encrypted(&mut slot, &mut chunk[..n])?;
    }

    pending.push(PendingEntry {
        file,
        expected,
        row: BlobEntryRow {
            hash: spooled.real_hash,
            size: spooled.pre_compression_size,
            offset,
            final_size: writer.offset() - offset,
            encryption_key: slot.key(),
            compression_alg: spooled.compression_alg.map(str::to_string),
        },
    });
    Ok(())
}

/// A file could not be read at upload time.
fn entry_read_failure(
    session: &Arc<BackupSession>,
    file: &FileRecord,
    expected: Option<ContentHash>,
    err: &anyhow::Error,
) {
    match expected {
        None => {
            // Staked plan: the file is simply not recorded this run.
            info!(
                "could not read staked file {}; skipping this run: {err:#}",
                file.path.display()
            );
        }
        Some(hash) => {
            warn!(
                "could not read {} for upload: {err:#}",
                file.path.display()
            );
            let mut late = session.late.lock();
            revive_next_waiter(session, &mut late, &hash, &file.path);
        }
    }
}

/// Pop the failed head of the hash-late list and re-enqueue the next waiter,
/// if any, as a fresh hashed plan.
fn revive_next_waiter(
    session: &Arc<BackupSession>,
    late: &mut LateGuard<'_>,
    hash: &ContentHash,
    failed: &std::path::Path,
) {
    if let Some(next) = late.finish_failure(hash, failed) {
        debug!(
            "reviving {} as the new source for {}",
            next.path.display(),
            hex::encode(hash)
        );
        session.inflight.add(1);
        let confirmed_size = next.info.size;
        if !session.send_plan(Planned::Hashed {
            file: next,
            hash: *hash,
            confirmed_size,
        }) {
            session.inflight.sub(1);
            warn!("bucketer gone; dropping revived waiter for {}", hex::encode(hash));
        }
    }
}

/// Commit one uploaded blob. Runs entirely under the hash-late mutex so no
/// hasher can check the catalog between our rows landing and the map entries
/// disappearing.
fn commit_batch(
    session: &Arc<BackupSession>,
    conn: &CatalogConn,
    blob: BlobMeta,
    completions: Vec<crate::storage::StorageCompletion>,
    pending: Vec<PendingEntry>,
) -> Result<()> {
    let mut late = session.late.lock();
    let mut rows: Vec<BlobEntryRow> = Vec::with_capacity(pending.len());
    let mut files: Vec<FileRowWrite> = Vec::new();

    for entry in pending {
        match entry.expected {
            // Hashed plan whose content held still: this upload satisfies
            // the claim, so every waiter commits against it.
            Some(expected) if expected == entry.row.hash => {
                let waiters = late.finish_success(&expected);
                assert_eq!(
                    waiters[0].path, entry.file.path,
                    "hash-late head is not the uploaded file"
                );
                for waiter in waiters {
                    files.push(FileRowWrite {
                        path: catalog_key(&waiter.path),
                        hash: expected,
                        fs_modified: waiter.info.fs_modified,
                        permissions: waiter.info.permissions,
                    });
                }
            }
            // Content changed under us: revive the next waiter for the old
            // hash, and still record this path against what the blob now
            // actually contains.
            Some(expected) => {
                revive_next_waiter(session, &mut late, &expected, &entry.file.path);
                files.push(FileRowWrite {
                    path: catalog_key(&entry.file.path),
                    hash: entry.row.hash,
                    fs_modified: entry.file.info.fs_modified,
                    permissions: entry.file.info.permissions,
                });
            }
            // Staked plan: the uploaded bytes define the hash.
            None => {
                files.push(FileRowWrite {
                    path: catalog_key(&entry.file.path),
                    hash: entry.row.hash,
                    fs_modified: entry.file.info.fs_modified,
                    permissions: entry.file.info.permissions,
                });
            }
        }
        rows.push(entry.row);
    }

    conn.commit_blob(&blob, &completions, &rows, &files, session.now)
        .context("commit blob to catalog")?;
    drop(late);

    RunStats::bump(&session.stats.blobs);
    session
        .stats
        .uploaded_entries
        .fetch_add(rows.len() as u64, std::sync::atomic::Ordering::Relaxed);
    session.stats.add_bytes(blob.size);
    debug!(
        "committed blob {} ({} entries, {} bytes)",
        hex::encode(blob.blob_id),
        rows.len(),
        blob.size
    );
    Ok(())
}

/// Padding length drawn uniformly from the additive bounds
/// `[min_bytes + size*min_pct, max_bytes + size*max_pct]`.
fn padding_len(settings: &Settings, size: u64) -> u64 {
    let lo = settings.padding_min_bytes + (size as f64 * settings.padding_min_percent) as u64;
    let hi = settings.padding_max_bytes + (size as f64 * settings.padding_max_percent) as u64;
    assert!(lo <= hi, "padding bounds inverted");
    rand::thread_rng().gen_range(lo..=hi)
}
