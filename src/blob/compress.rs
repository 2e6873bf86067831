//! Entry spooling: one pass over the source file verifies its SHA-256 and
//! writes a raw spool plus (when the extension is worth trying) a zstd spool.
//! The smaller of the two is what goes into the blob, so upload memory stays
//! bounded by the copy chunk regardless of file size.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use crate::types::ContentHash;
use crate::utils::config::BlobConsts;

/// Compression algorithm tag recorded in the catalog.
pub const ZSTD_ALG: &str = "zstd";

/// One fully spooled entry, ready to stream through encryption. `spool` is
/// rewound to the start of the chosen representation.
pub struct SpooledEntry {
    /// SHA-256 of the raw file bytes as actually read.
    pub real_hash: ContentHash,
    /// Raw byte count as actually read.
    pub pre_compression_size: u64,
    /// Chosen bytes (raw or compressed).
    pub spool: File,
    /// Length of the chosen bytes.
    pub spooled_size: u64,
    /// `Some(ZSTD_ALG)` when the compressed form won.
    pub compression_alg: Option<&'static str>,
}

/// True when the extension is not on the never-compress list.
pub fn worth_compressing(path: &Path, no_compression_exts: &[String]) -> bool {
    let ext = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => ext.to_lowercase(),
        None => return true,
    };
    !no_compression_exts.iter().any(|e| e.to_lowercase() == ext)
}

/// Read `reader` to the end, hashing raw bytes and spooling both raw and
/// (optionally) compressed forms to anonymous temp files. Keeps compression
/// only when the output shrank.
pub fn spool_entry(
    reader: &mut dyn Read,
    path: &Path,
    no_compression_exts: &[String],
) -> Result<SpooledEntry> {
    let mut raw_spool = tempfile::tempfile().context("create raw spool")?;
    let mut encoder = match worth_compressing(path, no_compression_exts) {
        true => {
            let spool = tempfile::tempfile().context("create compressed spool")?;
            Some(
                zstd::Encoder::new(spool, BlobConsts::ZSTD_LEVEL)
                    .context("create zstd encoder")?,
            )
        }
        false => None,
    };

    let mut hasher = Sha256::new();
    let mut raw_size = 0u64;
    let mut chunk = vec![0u8; BlobConsts::COPY_CHUNK_SIZE];
    loop {
        let n = reader
            .read(&mut chunk)
            .with_context(|| format!("read {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
        raw_size += n as u64;
        raw_spool.write_all(&chunk[..n]).context("write raw spool")?;
        if let Some(ref mut enc) = encoder {
            enc.write_all(&chunk[..n]).context("write compressed spool")?;
        }
    }
    let real_hash: ContentHash = hasher.finalize().into();

    let compressed = match encoder {
        Some(enc) => {
            let mut spool = enc.finish().context("finish zstd stream")?;
            let size = spool
                .seek(SeekFrom::End(0))
                .context("measure compressed spool")?;
            Some((spool, size))
        }
        None => None,
    };

    let (mut spool, spooled_size, compression_alg) = match compressed {
        Some((spool, size)) if size < raw_size => (spool, size, Some(ZSTD_ALG)),
        _ => (raw_spool, raw_size, None),
    };
    spool
        .seek(SeekFrom::Start(0))
        .context("rewind entry spool")?;

    Ok(SpooledEntry {
        real_hash,
        pre_compression_size: raw_size,
        spool,
        spooled_size,
        compression_alg,
    })
}
