//! Catalog: typed operations over the backup catalog
//! (files, sizes, blobs, blob_entries, blob_storage).
//!
//! All SQL lives in this module. Every pipeline thread opens its own
//! connection; WAL keeps readers concurrent and `busy_timeout` serializes the
//! writers.

mod connection;
mod ops;

pub use connection::{Catalog, CatalogConn, PulseTx};
pub use ops::{BlobEntryRow, BlobMeta, CurrentRow, FileRowWrite};

/// Set before anything else so concurrent first connections wait instead of
/// failing while one of them switches the journal mode or creates schema.
pub(crate) const BUSY_TIMEOUT_PRAGMA: &str = "PRAGMA busy_timeout = 30000;";

/// WAL tuning pragmas (synchronous, autocheckpoint, size limit, foreign
/// keys). Use after PRAGMA journal_mode = WAL.
pub(crate) const WAL_PRAGMAS: &str = r#"
        PRAGMA synchronous = NORMAL;
        PRAGMA wal_autocheckpoint = 10000;
        PRAGMA journal_size_limit = 67108864;
        PRAGMA foreign_keys = ON;
        "#;

/// Schema for the catalog tables.
///
/// `files` is an append-only history of path → content versions; for any path
/// at most one row has `end IS NULL` (the current row), enforced by the
/// partial unique index. `files.hash` and `blob_entries.hash` both reference
/// `sizes(hash)`, so a size row must be written before either.
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sizes (
    hash BLOB PRIMARY KEY,
    size INTEGER NOT NULL
) WITHOUT ROWID;
CREATE INDEX IF NOT EXISTS idx_sizes_size ON sizes(size);

CREATE TABLE IF NOT EXISTS files (
    path TEXT NOT NULL,
    hash BLOB NOT NULL REFERENCES sizes(hash),
    start INTEGER NOT NULL,
    end INTEGER,
    fs_modified INTEGER NOT NULL,
    permissions INTEGER NOT NULL
);
CREATE UNIQUE INDEX IF NOT EXISTS idx_files_current ON files(path) WHERE end IS NULL;
CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);

CREATE TABLE IF NOT EXISTS blobs (
    blob_id BLOB PRIMARY KEY,
    padding_key BLOB NOT NULL,
    size INTEGER NOT NULL,
    final_hash BLOB NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS blob_entries (
    hash BLOB PRIMARY KEY REFERENCES sizes(hash),
    blob_id BLOB NOT NULL REFERENCES blobs(blob_id),
    offset INTEGER NOT NULL,
    final_size INTEGER NOT NULL,
    encryption_key BLOB NOT NULL,
    compression_alg TEXT
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS blob_storage (
    blob_id BLOB NOT NULL REFERENCES blobs(blob_id),
    storage_id TEXT NOT NULL,
    path TEXT NOT NULL,
    checksum TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    PRIMARY KEY (blob_id, storage_id)
);
"#;
