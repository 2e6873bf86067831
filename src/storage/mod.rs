//! Storage destinations: the `UploadService` contract and its backends.

mod directory;

pub use directory::{DirectoryStore, MultiStore};

use anyhow::Result;

use crate::types::ContentHash;

/// One destination's receipt for a finished blob.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageCompletion {
    pub storage_id: String,
    /// Destination-relative path of the stored blob.
    pub path: String,
    /// Destination checksum of the stored bytes (hex).
    pub checksum: String,
    pub size: u64,
}

/// A stateful destination adapter. Not safe for concurrent use; reusable
/// sequentially. Each uploader worker owns exactly one for its lifetime.
///
/// Lifecycle per blob: `begin`, any number of `write`s, then either `end`
/// (finalize at every replica, one completion each) or `cancel` (best-effort
/// removal of partial destination blobs).
pub trait UploadService: Send {
    fn begin(&mut self, blob_id: &[u8; 32]) -> Result<()>;
    fn write(&mut self, buf: &[u8]) -> Result<()>;
    fn end(&mut self, final_hash: &ContentHash, total_size: u64) -> Result<Vec<StorageCompletion>>;
    fn cancel(&mut self);
}

/// Produces one [`UploadService`] per uploader worker.
pub type ServiceFactory = dyn Fn() -> Result<Box<dyn UploadService>> + Send + Sync;
