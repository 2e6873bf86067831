//! Filesystem access behind small traits so tests can inject their own
//! walker and opener.

use anyhow::Result;
use std::fs::Metadata;
use std::io::Read;
use std::path::Path;

use crate::types::{FileInfo, FileRecord};

/// Recursive directory walk. Implementations must invoke `on_file` for every
/// regular-file leaf and block until all callbacks have returned.
pub trait Walker: Send + Sync {
    fn walk(&self, root: &Path, on_file: &mut dyn FnMut(FileRecord) -> Result<()>) -> Result<()>;
}

/// Stat and open files for reading.
pub trait FileOpener: Send + Sync {
    fn stat(&self, path: &Path) -> std::io::Result<FileInfo>;
    fn open(&self, path: &Path) -> std::io::Result<Box<dyn Read + Send>>;
}

/// Stat metadata → [`FileInfo`]. Negative modtimes indicate a clock or
/// filesystem bug; treat them as fatal.
pub fn file_info_from_metadata(meta: &Metadata) -> FileInfo {
    let fs_modified = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs() as i64)
        .unwrap_or_else(|| panic!("negative or unreadable modtime"));
    FileInfo {
        size: meta.len(),
        fs_modified,
        permissions: permission_bits(meta),
    }
}

#[cfg(unix)]
fn permission_bits(meta: &Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    meta.permissions().mode() & 0o7777
}

#[cfg(not(unix))]
fn permission_bits(_meta: &Metadata) -> u32 {
    0
}

/// Production walker: walkdir, symlinks not followed, anything that is not a
/// regular file silently skipped. Unreadable subtrees are logged and skipped.
pub struct OsWalker;

impl Walker for OsWalker {
    fn walk(&self, root: &Path, on_file: &mut dyn FnMut(FileRecord) -> Result<()>) -> Result<()> {
        for entry in walkdir::WalkDir::new(root).follow_links(false) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    log::warn!("error accessing path during walk: {}", err);
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let meta = match entry.metadata() {
                Ok(meta) => meta,
                Err(err) => {
                    log::warn!("stat failed for {}: {}", entry.path().display(), err);
                    continue;
                }
            };
            on_file(FileRecord {
                path: entry.into_path(),
                info: file_info_from_metadata(&meta),
            })?;
        }
        Ok(())
    }
}

/// Production opener over std::fs. Files above the mmap threshold are read
/// through memory-mapped I/O.
pub struct OsFileOpener;

impl FileOpener for OsFileOpener {
    fn stat(&self, path: &Path) -> std::io::Result<FileInfo> {
        let meta = std::fs::symlink_metadata(path)?;
        Ok(file_info_from_metadata(&meta))
    }

    fn open(&self, path: &Path) -> std::io::Result<Box<dyn Read + Send>> {
        use crate::utils::config::HashingConsts;
        let file = std::fs::File::open(path)?;
        let meta = file.metadata()?;
        if meta.len() > HashingConsts::HASH_MMAP_THRESHOLD {
            let mmap = unsafe { memmap2::Mmap::map(&file)? };
            return Ok(Box::new(MmapReader { mmap, pos: 0 }));
        }
        Ok(Box::new(file))
    }
}

/// Read adapter over a memory map.
struct MmapReader {
    mmap: memmap2::Mmap,
    pos: usize,
}

impl Read for MmapReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.mmap[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}
