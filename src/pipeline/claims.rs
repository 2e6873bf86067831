//! Size-claim map: process-wide reservation on a file-size value.
//!
//! While a claim on size `s` exists, at most one planned item of size `s` is
//! flowing through hasher → bucketer → uploader unhashed, and any other file
//! of size `s` entering the pipeline blocks on the claim before consulting
//! the catalog. This is what lets the scanner skip hashing a file whose size
//! has never been seen.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};

/// One exclusive per-size lock. Held by the staker from creation until the
/// uploader releases it.
struct Claim {
    released: Mutex<bool>,
    cond: Condvar,
}

impl Claim {
    fn new() -> Self {
        Self {
            released: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    fn wait(&self) {
        let mut released = self.released.lock().unwrap();
        while !*released {
            released = self.cond.wait(released).unwrap();
        }
    }

    fn release(&self) {
        let mut released = self.released.lock().unwrap();
        *released = true;
        self.cond.notify_all();
    }
}

/// Map from file size → exclusive claim, under a short mutex.
#[derive(Default)]
pub struct SizeClaimMap {
    claims: Mutex<HashMap<u64, Arc<Claim>>>,
}

impl SizeClaimMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `size`. Returns false if some other file already holds the
    /// claim. Atomic with respect to other stakes.
    pub fn stake(&self, size: u64) -> bool {
        let mut claims = self.claims.lock().unwrap();
        if claims.contains_key(&size) {
            return false;
        }
        claims.insert(size, Arc::new(Claim::new()));
        true
    }

    /// If a claim on `size` exists, block until the staker releases it, then
    /// return true. The waiter never restakes. Returns false when no claim
    /// exists.
    pub fn wait_then_release(&self, size: u64) -> bool {
        let claim = {
            let claims = self.claims.lock().unwrap();
            match claims.get(&size) {
                Some(claim) => Arc::clone(claim),
                None => return false,
            }
        };
        // Wait outside the map mutex; release() may need it.
        claim.wait();
        true
    }

    /// Unlock and remove the claim. Every successful [`stake`](Self::stake)
    /// must be paired with exactly one release, from the uploader path that
    /// planned the staked item, on every exit (success, content mismatch, or
    /// unreadable file).
    pub fn release(&self, size: u64) {
        let claim = {
            let mut claims = self.claims.lock().unwrap();
            claims
                .remove(&size)
                .unwrap_or_else(|| panic!("released size claim {size} that was never staked"))
        };
        claim.release();
    }

    /// Number of outstanding claims. Zero after a clean run.
    pub fn len(&self) -> usize {
        self.claims.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
