//! Directory-backed storage: one file per blob under a fan-out subdirectory.

use anyhow::{Context, Result, bail};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::types::ContentHash;

use super::{StorageCompletion, UploadService};

/// Blobs land at `<root>/<first two hex chars>/<hex blob id>`, written to a
/// temp file first and renamed into place on `end`.
pub struct DirectoryStore {
    root: PathBuf,
    storage_id: String,
    inflight: Option<Inflight>,
}

struct Inflight {
    blob_id: [u8; 32],
    temp_path: PathBuf,
    file: File,
    hasher: Sha256,
    written: u64,
}

impl DirectoryStore {
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("create storage directory {}", root.display()))?;
        Ok(Self {
            root: root.to_path_buf(),
            storage_id: format!("dir:{}", root.display()),
            inflight: None,
        })
    }

    fn final_rel_path(blob_id: &[u8; 32]) -> (String, String) {
        let hex_id = hex::encode(blob_id);
        (hex_id[..2].to_string(), hex_id)
    }
}

impl UploadService for DirectoryStore {
    fn begin(&mut self, blob_id: &[u8; 32]) -> Result<()> {
        assert!(self.inflight.is_none(), "begin while a blob is in flight");
        let temp_path = self.root.join(format!("tmp-{}", hex::encode(blob_id)));
        let file = File::create(&temp_path)
            .with_context(|| format!("create blob temp file {}", temp_path.display()))?;
        self.inflight = Some(Inflight {
            blob_id: *blob_id,
            temp_path,
            file,
            hasher: Sha256::new(),
            written: 0,
        });
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        let inflight = self.inflight.as_mut().expect("write before begin");
        inflight.file.write_all(buf).context("write blob bytes")?;
        inflight.hasher.update(buf);
        inflight.written += buf.len() as u64;
        Ok(())
    }

    fn end(&mut self, final_hash: &ContentHash, total_size: u64) -> Result<Vec<StorageCompletion>> {
        let inflight = self.inflight.take().expect("end before begin");
        if inflight.written != total_size {
            bail!(
                "blob size mismatch: wrote {} bytes, caller counted {}",
                inflight.written,
                total_size
            );
        }
        let checksum: ContentHash = inflight.hasher.finalize().into();
        if &checksum != final_hash {
            bail!("blob checksum mismatch at {}", inflight.temp_path.display());
        }
        inflight.file.sync_all().context("sync blob file")?;
        drop(inflight.file);

        let (fanout, hex_id) = Self::final_rel_path(&inflight.blob_id);
        let dir = self.root.join(&fanout);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create fan-out directory {}", dir.display()))?;
        let final_path = dir.join(&hex_id);
        std::fs::rename(&inflight.temp_path, &final_path)
            .with_context(|| format!("move blob into place at {}", final_path.display()))?;

        Ok(vec![StorageCompletion {
            storage_id: self.storage_id.clone(),
            path: format!("{fanout}/{hex_id}"),
            checksum: hex::encode(checksum),
            size: total_size,
        }])
    }

    fn cancel(&mut self) {
        if let Some(inflight) = self.inflight.take() {
            drop(inflight.file);
            if let Err(e) = std::fs::remove_file(&inflight.temp_path) {
                log::warn!(
                    "could not remove partial blob {}: {}",
                    inflight.temp_path.display(),
                    e
                );
            }
        }
    }
}

/// Replicates every blob to several directory stores; completions are the
/// concatenation of each replica's.
pub struct MultiStore {
    replicas: Vec<DirectoryStore>,
}

impl MultiStore {
    pub fn open(roots: &[PathBuf]) -> Result<Self> {
        assert!(!roots.is_empty(), "at least one storage destination");
        let replicas = roots
            .iter()
            .map(|r| DirectoryStore::open(r))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { replicas })
    }
}

impl UploadService for MultiStore {
    fn begin(&mut self, blob_id: &[u8; 32]) -> Result<()> {
        for replica in &mut self.replicas {
            replica.begin(blob_id)?;
        }
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> Result<()> {
        for replica in &mut self.replicas {
            replica.write(buf)?;
        }
        Ok(())
    }

    fn end(&mut self, final_hash: &ContentHash, total_size: u64) -> Result<Vec<StorageCompletion>> {
        let mut completions = Vec::with_capacity(self.replicas.len());
        for replica in &mut self.replicas {
            completions.extend(replica.end(final_hash, total_size)?);
        }
        Ok(completions)
    }

    fn cancel(&mut self) {
        for replica in &mut self.replicas {
            replica.cancel();
        }
    }
}
