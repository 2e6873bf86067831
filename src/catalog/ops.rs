//! Typed catalog operations. Statement-level methods compose into the
//! hasher's short transactions; `commit_blob` is the uploader's single
//! atomic commit.

use anyhow::{Context, Result};
use std::path::Path;

use crate::storage::StorageCompletion;
use crate::types::ContentHash;

use super::CatalogConn;

/// The currently-`end IS NULL` row for a path, joined with its size.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CurrentRow {
    pub hash: ContentHash,
    pub size: u64,
    pub fs_modified: i64,
}

/// Blob-level metadata written by `commit_blob`.
#[derive(Clone, Debug)]
pub struct BlobMeta {
    pub blob_id: [u8; 32],
    pub padding_key: [u8; 16],
    /// Total post-encryption size including padding.
    pub size: u64,
    /// SHA-256 over the full post-encryption stream.
    pub final_hash: ContentHash,
}

/// One stored content hash's region within a blob.
#[derive(Clone, Debug)]
pub struct BlobEntryRow {
    pub hash: ContentHash,
    /// Decompressed size, for the `sizes` table.
    pub size: u64,
    /// Post-encryption offset of this entry within the blob.
    pub offset: u64,
    /// Post-compression length of this entry.
    pub final_size: u64,
    pub encryption_key: [u8; 16],
    /// `None` when the entry was stored uncompressed.
    pub compression_alg: Option<String>,
}

/// A `files` row queued for `commit_blob` (current row ended + fresh insert).
#[derive(Clone, Debug)]
pub struct FileRowWrite {
    pub path: String,
    pub hash: ContentHash,
    pub fs_modified: i64,
    pub permissions: u32,
}

fn db_path(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

impl CatalogConn {
    /// The current row for `path`, or None if the catalog has never seen it
    /// (or its last version was deleted).
    pub fn lookup_current(&self, path: &Path) -> Result<Option<CurrentRow>> {
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT f.hash, s.size, f.fs_modified
                 FROM files f JOIN sizes s ON s.hash = f.hash
                 WHERE f.path = ?1 AND f.end IS NULL",
            )
            .context("prepare lookup_current")?;
        let row = stmt
            .query_row([db_path(path)], |row| {
                let hash: Vec<u8> = row.get(0)?;
                let size: i64 = row.get(1)?;
                let fs_modified: i64 = row.get(2)?;
                Ok((hash, size, fs_modified))
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("query lookup_current")?;
        Ok(row.map(|(hash, size, fs_modified)| CurrentRow {
            hash: hash_from_blob(&hash),
            size: size.max(0) as u64,
            fs_modified,
        }))
    }

    /// Whether any content of exactly this size has ever been stored. Drives
    /// the scanner's unique-size fast path.
    pub fn any_hash_for_size(&self, size: u64) -> Result<Option<ContentHash>> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT hash FROM sizes WHERE size = ?1 LIMIT 1")
            .context("prepare any_hash_for_size")?;
        let row = stmt
            .query_row([size as i64], |row| row.get::<_, Vec<u8>>(0))
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("query any_hash_for_size")?;
        Ok(row.map(|h| hash_from_blob(&h)))
    }

    /// Whether this hash is durably backed up (a `blob_entries` row exists).
    pub fn hash_is_stored(&self, hash: &ContentHash) -> Result<bool> {
        let mut stmt = self
            .conn
            .prepare_cached("SELECT 1 FROM blob_entries WHERE hash = ?1")
            .context("prepare hash_is_stored")?;
        let found = stmt
            .query_row([hash.as_slice()], |_| Ok(()))
            .map(|_| true)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(false),
                other => Err(other),
            })
            .context("query hash_is_stored")?;
        Ok(found)
    }

    /// Atomically (within the caller's transaction) close any current row for
    /// `path` and insert a fresh one. The `sizes` row for `hash` must already
    /// exist.
    pub fn end_current_and_insert(
        &self,
        path: &Path,
        hash: &ContentHash,
        fs_modified: i64,
        permissions: u32,
        now: i64,
    ) -> Result<()> {
        let path = db_path(path);
        self.conn
            .prepare_cached("UPDATE files SET end = ?2 WHERE path = ?1 AND end IS NULL")
            .context("prepare end current")?
            .execute(rusqlite::params![path, now])
            .context("end current row")?;
        self.conn
            .prepare_cached(
                "INSERT INTO files (path, hash, start, end, fs_modified, permissions)
                 VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
            )
            .context("prepare insert file row")?
            .execute(rusqlite::params![
                path,
                hash.as_slice(),
                now,
                fs_modified,
                permissions
            ])
            .context("insert file row")?;
        Ok(())
    }

    /// Update only metadata columns when content is unchanged.
    pub fn touch_current(&self, path: &Path, fs_modified: i64, permissions: u32) -> Result<()> {
        self.conn
            .prepare_cached(
                "UPDATE files SET fs_modified = ?2, permissions = ?3
                 WHERE path = ?1 AND end IS NULL",
            )
            .context("prepare touch_current")?
            .execute(rusqlite::params![db_path(path), fs_modified, permissions])
            .context("touch current row")?;
        Ok(())
    }

    /// Insert-or-ignore a `sizes` row. Must precede any `blob_entries` or
    /// `files` row referencing the hash.
    pub fn insert_size(&self, hash: &ContentHash, size: u64) -> Result<()> {
        self.conn
            .prepare_cached("INSERT OR IGNORE INTO sizes (hash, size) VALUES (?1, ?2)")
            .context("prepare insert_size")?
            .execute(rusqlite::params![hash.as_slice(), size as i64])
            .context("insert size row")?;
        Ok(())
    }

    /// Commit one uploaded blob in a single transaction: the blob row, one
    /// storage row per destination, per-entry size and entry rows, and all
    /// file rows produced by hash-late processing.
    pub fn commit_blob(
        &self,
        blob: &BlobMeta,
        storages: &[StorageCompletion],
        entries: &[BlobEntryRow],
        files: &[FileRowWrite],
        now: i64,
    ) -> Result<()> {
        self.begin()?;
        let result = self.commit_blob_rows(blob, storages, entries, files, now);
        match result {
            Ok(()) => self.commit(),
            Err(e) => {
                let _ = self.rollback();
                Err(e)
            }
        }
    }

    fn commit_blob_rows(
        &self,
        blob: &BlobMeta,
        storages: &[StorageCompletion],
        entries: &[BlobEntryRow],
        files: &[FileRowWrite],
        now: i64,
    ) -> Result<()> {
        for entry in entries {
            self.insert_size(&entry.hash, entry.size)?;
        }
        self.conn
            .prepare_cached(
                "INSERT INTO blobs (blob_id, padding_key, size, final_hash)
                 VALUES (?1, ?2, ?3, ?4)",
            )
            .context("prepare insert blob")?
            .execute(rusqlite::params![
                blob.blob_id.as_slice(),
                blob.padding_key.as_slice(),
                blob.size as i64,
                blob.final_hash.as_slice()
            ])
            .context("insert blob row")?;
        for storage in storages {
            self.conn
                .prepare_cached(
                    "INSERT INTO blob_storage (blob_id, storage_id, path, checksum, timestamp)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )
                .context("prepare insert blob_storage")?
                .execute(rusqlite::params![
                    blob.blob_id.as_slice(),
                    storage.storage_id,
                    storage.path,
                    storage.checksum,
                    now
                ])
                .context("insert blob_storage row")?;
        }
        for entry in entries {
            self.conn
                .prepare_cached(
                    "INSERT OR IGNORE INTO blob_entries
                     (hash, blob_id, offset, final_size, encryption_key, compression_alg)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .context("prepare insert blob_entry")?
                .execute(rusqlite::params![
                    entry.hash.as_slice(),
                    blob.blob_id.as_slice(),
                    entry.offset as i64,
                    entry.final_size as i64,
                    entry.encryption_key.as_slice(),
                    entry.compression_alg
                ])
                .context("insert blob_entry row")?;
        }
        for file in files {
            self.end_current_and_insert(
                Path::new(&file.path),
                &file.hash,
                file.fs_modified,
                file.permissions,
                now,
            )?;
        }
        Ok(())
    }

    /// All current paths under `prefix`. Directory prefixes carry a trailing
    /// separator so `/r/` cannot match `/rx/...`.
    pub fn list_current_under(&self, prefix: &Path) -> Result<Vec<String>> {
        let prefix = db_path(prefix);
        let mut stmt = self
            .conn
            .prepare_cached(
                "SELECT path FROM files
                 WHERE end IS NULL AND substr(path, 1, length(?1)) = ?1",
            )
            .context("prepare list_current_under")?;
        let rows = stmt
            .query_map([prefix], |row| row.get::<_, String>(0))
            .context("query list_current_under")?;
        let mut paths = Vec::new();
        for row in rows {
            paths.push(row.context("read current path row")?);
        }
        Ok(paths)
    }

    /// Mark a path deleted by ending its current row.
    pub fn end_current(&self, path: &Path, now: i64) -> Result<()> {
        self.conn
            .prepare_cached("UPDATE files SET end = ?2 WHERE path = ?1 AND end IS NULL")
            .context("prepare end_current")?
            .execute(rusqlite::params![db_path(path), now])
            .context("end current row")?;
        Ok(())
    }
}

/// 32-byte hash from a BLOB column. Panics on width mismatch; that is a
/// corrupt catalog, not a recoverable state.
fn hash_from_blob(blob: &[u8]) -> ContentHash {
    let mut hash = [0u8; 32];
    assert_eq!(blob.len(), 32, "catalog hash column must be 32 bytes");
    hash.copy_from_slice(blob);
    hash
}
