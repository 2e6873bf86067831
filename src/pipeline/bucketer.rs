//! Bucketer: pack planned uploads into blob batches.
//!
//! Single task, single buffer. Items are batched in arrival order until the
//! buffered sizes reach the blob size threshold or the buffer outgrows the
//! count threshold; oversized items ship alone without touching the buffer.
//! Flush sentinels (from the scanner's heartbeat) push out a stalled partial
//! batch; channel closure flushes whatever remains.

use crossbeam_channel::{Receiver, Sender};
use log::debug;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::types::{Batch, Planned};

use super::session::BackupSession;

pub fn spawn_bucketer(
    session: &Arc<BackupSession>,
    plan_rx: Receiver<Planned>,
    batch_tx: Sender<Batch>,
) -> JoinHandle<()> {
    let session = Arc::clone(session);
    thread::spawn(move || bucketer_loop(&session, plan_rx, batch_tx))
}

fn bucketer_loop(session: &Arc<BackupSession>, plan_rx: Receiver<Planned>, batch_tx: Sender<Batch>) {
    let min_size = session.settings.min_blob_size;
    let min_count = session.settings.min_blob_count;
    let mut buffer: Batch = Vec::new();
    let mut buffered_size = 0u64;

    while let Ok(item) = plan_rx.recv() {
        if matches!(item, Planned::Flush) {
            if !buffer.is_empty() {
                debug!(
                    "flushing partial batch: {} items, {} bytes",
                    buffer.len(),
                    buffered_size
                );
                emit(session, &batch_tx, std::mem::take(&mut buffer));
                buffered_size = 0;
            }
            continue;
        }

        let sz = item.relevant_size();
        if sz >= min_size {
            // Big enough on its own; the buffer keeps its order.
            emit(session, &batch_tx, vec![item]);
            continue;
        }

        buffer.push(item);
        buffered_size += sz;
        if buffered_size >= min_size || buffer.len() > min_count {
            emit(session, &batch_tx, std::mem::take(&mut buffer));
            buffered_size = 0;
        }
    }

    if !buffer.is_empty() {
        emit(session, &batch_tx, buffer);
    }
}

/// Deliver a batch. If the uploader side is gone the run is already failing;
/// settle the batch's in-flight units and claims so the drain can still
/// finish.
fn emit(session: &BackupSession, batch_tx: &Sender<Batch>, batch: Batch) {
    if let Err(returned) = batch_tx.send(batch) {
        for item in returned.0 {
            if let Planned::Staked { claim, .. } = item {
                session.claims.release(claim);
            }
            session.inflight.sub(1);
        }
    }
}
