//! Hash-late map: files sharing a content hash whose upload is in flight.
//!
//! The first file to claim a hash becomes the upload source; files that reach
//! the hasher with the same hash while that upload is queued or running are
//! latecomers, committed in the same transaction as the source once the blob
//! lands. The map's single mutex also serializes the read-modify-write
//! sequence { catalog check for `hash_is_stored` → insert/append → commit of
//! file rows for the hash }, so an uploader can never commit the stored-hash
//! state between another thread's check and its append. Callers therefore
//! hold the guard across the whole critical section.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use crate::types::{ContentHash, FileRecord};

/// Outcome of a hasher consulting the map for a freshly computed hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LateDecision {
    /// The hash already has a `blob_entries` row; just record the file.
    AlreadyStored,
    /// An upload for this hash is in flight; the file was queued behind it.
    Latecomer,
    /// The caller is now the upload source for this hash.
    FirstClaim,
}

/// Map from content hash → ordered non-empty list of waiting files. The head
/// of each list is the file whose data is currently being, or has most
/// recently been, uploaded for that hash.
#[derive(Default)]
pub struct HashLateMap {
    inner: Mutex<HashMap<ContentHash, Vec<FileRecord>>>,
}

impl HashLateMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire `M_late`. Hold the guard across the catalog check and any
    /// commit that depends on it.
    pub fn lock(&self) -> LateGuard<'_> {
        LateGuard {
            map: self.inner.lock().unwrap(),
        }
    }
}

/// Exclusive view of the hash-late map.
pub struct LateGuard<'a> {
    map: MutexGuard<'a, HashMap<ContentHash, Vec<FileRecord>>>,
}

impl LateGuard<'_> {
    /// Decide what to do with a hashed file. `stored` is the result of the
    /// catalog's `hash_is_stored` check, performed by the caller while this
    /// guard is held.
    pub fn record_latecomer_or_claim(
        &mut self,
        hash: ContentHash,
        file: FileRecord,
        stored: bool,
    ) -> LateDecision {
        if stored {
            return LateDecision::AlreadyStored;
        }
        match self.map.get_mut(&hash) {
            Some(waiters) => {
                waiters.push(file);
                LateDecision::Latecomer
            }
            None => {
                self.map.insert(hash, vec![file]);
                LateDecision::FirstClaim
            }
        }
    }

    /// The upload for `hash` committed: return and remove the full waiter
    /// list so the caller records every file against the stored hash.
    pub fn finish_success(&mut self, hash: &ContentHash) -> Vec<FileRecord> {
        let waiters = self
            .map
            .remove(hash)
            .unwrap_or_else(|| panic!("no hash-late entry for {}", hex::encode(hash)));
        assert!(!waiters.is_empty(), "hash-late list must never be empty");
        waiters
    }

    /// The upload sourced from `original` failed (unreadable file or content
    /// mismatch): pop the head, which must be `original`, and return the new
    /// head if any so the caller can re-enqueue it for a fresh attempt. The
    /// entry is erased when no waiters remain.
    pub fn finish_failure(
        &mut self,
        hash: &ContentHash,
        original: &Path,
    ) -> Option<FileRecord> {
        let waiters = self
            .map
            .get_mut(hash)
            .unwrap_or_else(|| panic!("no hash-late entry for {}", hex::encode(hash)));
        let head = waiters.remove(0);
        assert_eq!(
            head.path, original,
            "hash-late head does not match the failed upload source"
        );
        match waiters.first() {
            Some(next) => Some(next.clone()),
            None => {
                self.map.remove(hash);
                None
            }
        }
    }

    /// Number of hashes with in-flight uploads. Zero after a clean run.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }
}
