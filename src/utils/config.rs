//! Application configuration constants.
//! Tuning and thresholds in one place.

use std::sync::OnceLock;
use std::time::Duration;

// ---- Package / paths (from CARGO_PKG_NAME, cached) ----

/// Package-derived paths: built once from `CARGO_PKG_NAME`, then cached.
pub struct PackagePaths {
    pkg_name: &'static str,
    catalog_filename: String,
    config_filename: String,
}

static PACKAGE_PATHS: OnceLock<PackagePaths> = OnceLock::new();

impl PackagePaths {
    /// Build and cache paths from `CARGO_PKG_NAME`. Called once on first use.
    pub fn get() -> &'static PackagePaths {
        PACKAGE_PATHS.get_or_init(|| {
            let pkg = env!("CARGO_PKG_NAME");
            PackagePaths {
                pkg_name: pkg,
                catalog_filename: format!(".{pkg}.db"),
                config_filename: format!(".{pkg}.toml"),
            }
        })
    }

    pub fn pkg_name(&self) -> &str {
        self.pkg_name
    }

    /// Default catalog filename (e.g. `.burrow.db`), placed in the working directory.
    pub fn catalog_filename(&self) -> &str {
        &self.catalog_filename
    }

    /// Config file looked up in the working directory (e.g. `.burrow.toml`).
    pub fn config_filename(&self) -> &str {
        &self.config_filename
    }
}

// ---- Hashing ----

/// Hashing I/O thresholds and buffer sizes.
pub struct HashingConsts;

impl HashingConsts {
    /// File size above which hashing uses memory-mapped I/O (bytes). 100 MB.
    pub const HASH_MMAP_THRESHOLD: u64 = 100 * 1024 * 1024;
    /// Chunk size for reading files below mmap threshold (bytes). 1 MB.
    pub const HASH_READ_CHUNK_SIZE: usize = 1024 * 1024;
}

// ---- Blobs ----

/// Blob packing thresholds and upload I/O tuning.
pub struct BlobConsts;

impl BlobConsts {
    /// Buffered plans are emitted as a blob once their sizes sum to this (bytes). 32 MB.
    pub const MIN_BLOB_SIZE: u64 = 32 * 1024 * 1024;
    /// Buffered plans are emitted once the buffer holds more than this many items.
    pub const MIN_BLOB_COUNT: usize = 100;
    /// Chunk size for streaming file bytes through the upload transform (bytes). 1 MB.
    pub const COPY_CHUNK_SIZE: usize = 1024 * 1024;
    /// zstd compression level for compressible entries.
    pub const ZSTD_LEVEL: i32 = 3;

    /// Extensions that are already compressed; entries with these skip the
    /// compression attempt entirely.
    pub fn default_no_compression_exts() -> Vec<String> {
        [
            "7z", "avi", "bz2", "flac", "gif", "gz", "jpeg", "jpg", "mkv", "mp3", "mp4", "ogg",
            "png", "rar", "webm", "webp", "xz", "zip", "zst",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

// ---- Padding ----

/// Blob padding bounds. Padding length is drawn uniformly from
/// `[MIN_BYTES + size*MIN_PERCENT, MAX_BYTES + size*MAX_PERCENT]`.
pub struct PaddingConsts;

impl PaddingConsts {
    pub const MIN_BYTES: u64 = 64;
    pub const MAX_BYTES: u64 = 4096;
    pub const MIN_PERCENT: f64 = 0.0;
    pub const MAX_PERCENT: f64 = 0.02;
}

// ---- Timing ----

/// Pipeline timing: scanner transaction pulse and bucketer flush heartbeat.
pub struct TimingConsts;

impl TimingConsts {
    /// The scanner's long-lived write transaction is committed and reopened
    /// this often to bound WAL growth.
    pub const SCAN_TX_PULSE: Duration = Duration::from_secs(1);
    /// Interval between flush sentinels sent to the bucketer after the walk
    /// finishes, so a stalled partial batch eventually ships.
    pub const FLUSH_HEARTBEAT: Duration = Duration::from_secs(1);
}

// ---- Streaming channel caps ----

/// Bounded channel capacities between pipeline stages.
pub struct ChannelCaps;

impl ChannelCaps {
    /// Scanner → hasher hash plans.
    pub const HASH_PLANS: usize = 50_000;
    /// Scanner/hasher/uploader → bucketer planned items.
    pub const PLANS: usize = 50_000;
    /// Bucketer → uploader batches.
    pub const BATCHES: usize = 16;
}
