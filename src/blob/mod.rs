//! Blob assembly: entry spooling, per-entry encryption, padding, and the
//! running post-encryption hash/size.

mod compress;
mod crypto;

pub use compress::{SpooledEntry, spool_entry};
pub use crypto::{EncryptSlot, random_blob_id, random_key};

use anyhow::Result;
use sha2::{Digest, Sha256};

use crate::storage::UploadService;
use crate::types::ContentHash;
use crate::utils::config::BlobConsts;

/// Accumulates one blob across a service: every encrypted byte is counted,
/// hashed, and tee'd to the destination writer. Entry offsets are read from
/// [`BlobWriter::offset`] before each entry starts.
pub struct BlobWriter<'s> {
    service: &'s mut dyn UploadService,
    hasher: Sha256,
    written: u64,
}

impl<'s> BlobWriter<'s> {
    pub fn begin(service: &'s mut dyn UploadService, blob_id: &[u8; 32]) -> Result<Self> {
        service.begin(blob_id)?;
        Ok(Self {
            service,
            hasher: Sha256::new(),
            written: 0,
        })
    }

    /// Current post-encryption running size; the next entry's offset.
    pub fn offset(&self) -> u64 {
        self.written
    }

    /// Encrypt `chunk` in place under `slot`, then hash, count, and forward it.
    pub fn write_encrypted(&mut self, slot: &mut EncryptSlot, chunk: &mut [u8]) -> Result<()> {
        slot.apply(chunk);
        self.hasher.update(&chunk[..]);
        self.written += chunk.len() as u64;
        self.service.write(chunk)
    }

    /// Append `len` zero bytes through a fresh padding slot.
    pub fn write_padding(&mut self, slot: &mut EncryptSlot, len: u64) -> Result<()> {
        let mut remaining = len;
        let mut chunk = vec![0u8; BlobConsts::COPY_CHUNK_SIZE.min(len.max(1) as usize)];
        while remaining > 0 {
            let take = chunk.len().min(remaining as usize);
            chunk[..take].fill(0);
            self.write_encrypted(slot, &mut chunk[..take])?;
            remaining -= take as u64;
        }
        Ok(())
    }

    /// Final post-encryption hash and size. The caller passes both to
    /// `UploadService::end`.
    pub fn finish(self) -> (ContentHash, u64) {
        (self.hasher.finalize().into(), self.written)
    }
}
