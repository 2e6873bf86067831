//! Public and internal types for the burrow API and pipeline.

use std::path::PathBuf;

use crate::utils::config::{BlobConsts, PaddingConsts};

/// SHA-256 content hash (32 bytes).
pub type ContentHash = [u8; 32];

/// Stat metadata for a regular file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// File size in bytes.
    pub size: u64,
    /// Modification time in seconds since epoch.
    pub fs_modified: i64,
    /// Permission bits (mode & 0o7777 on unix, 0 elsewhere).
    pub permissions: u32,
}

/// One regular file as seen by the scanner: absolute path plus stat metadata.
#[derive(Clone, Debug)]
pub struct FileRecord {
    pub path: PathBuf,
    pub info: FileInfo,
}

/// Scanner → hasher work item. `expected_hash` is present iff the catalog
/// previously knew this path with that hash.
#[derive(Clone, Debug)]
pub struct HashPlan {
    pub file: FileRecord,
    pub expected_hash: Option<ContentHash>,
}

/// Bucketer/uploader work item. Three shapes:
/// - `Staked`: the file has not been read; only its size is known and reserved
///   in the size-claim map.
/// - `Hashed`: the file was hashed and that hash is not yet in the catalog.
/// - `Flush`: sentinel telling the bucketer to emit any partial batch.
#[derive(Clone, Debug)]
pub enum Planned {
    Staked {
        file: FileRecord,
        claim: u64,
    },
    Hashed {
        file: FileRecord,
        hash: ContentHash,
        confirmed_size: u64,
    },
    Flush,
}

impl Planned {
    /// Size the bucketer batches by: confirmed size for hashed plans, the
    /// claimed size for staked plans. Panics on the flush sentinel.
    pub fn relevant_size(&self) -> u64 {
        match self {
            Planned::Staked { claim, .. } => *claim,
            Planned::Hashed { confirmed_size, .. } => *confirmed_size,
            Planned::Flush => panic!("flush sentinel has no size"),
        }
    }

    pub fn file(&self) -> &FileRecord {
        match self {
            Planned::Staked { file, .. } | Planned::Hashed { file, .. } => file,
            Planned::Flush => panic!("flush sentinel has no file"),
        }
    }
}

/// One blob's worth of planned uploads, in arrival order.
pub type Batch = Vec<Planned>;

/// Tuning and filtering settings consumed by the pipeline.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Hasher worker count (>= 1).
    pub num_hasher_threads: usize,
    /// Uploader worker count (>= 1).
    pub num_uploader_threads: usize,
    /// Blobs are emitted once the buffered size reaches this many bytes.
    pub min_blob_size: u64,
    /// Blobs are emitted once the buffer holds more than this many items.
    pub min_blob_count: usize,
    /// Padding bounds: length drawn uniformly from
    /// `[min_bytes + size*min_percent, max_bytes + size*max_percent]`.
    pub padding_min_bytes: u64,
    pub padding_max_bytes: u64,
    pub padding_min_percent: f64,
    pub padding_max_percent: f64,
    /// File extensions never worth compressing (case-insensitive, no dot).
    pub no_compression_exts: Vec<String>,
    /// Case-insensitive path prefixes to skip; compared with a trailing separator.
    pub exclude_prefixes: Vec<String>,
    /// Case-insensitive path suffixes to skip.
    pub exclude_suffixes: Vec<String>,
    /// When true, a read error while hashing drops the file instead of
    /// aborting the run.
    pub skip_hash_failures: bool,
    /// Seconds between periodic status log lines; -1 disables.
    pub upload_status_interval_seconds: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            num_hasher_threads: 2,
            num_uploader_threads: 2,
            min_blob_size: BlobConsts::MIN_BLOB_SIZE,
            min_blob_count: BlobConsts::MIN_BLOB_COUNT,
            padding_min_bytes: PaddingConsts::MIN_BYTES,
            padding_max_bytes: PaddingConsts::MAX_BYTES,
            padding_min_percent: PaddingConsts::MIN_PERCENT,
            padding_max_percent: PaddingConsts::MAX_PERCENT,
            no_compression_exts: BlobConsts::default_no_compression_exts(),
            exclude_prefixes: Vec::new(),
            exclude_suffixes: Vec::new(),
            skip_hash_failures: false,
            upload_status_interval_seconds: 60,
        }
    }
}
