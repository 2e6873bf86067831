//! End-to-end pipeline tests over a temp catalog, temp roots, and a
//! directory storage destination. Walk order and file reads are injected so
//! the concurrency scenarios are deterministic.

use anyhow::Result;
use burrow::catalog::Catalog;
use burrow::fswalk::{FileOpener, OsFileOpener, Walker, file_info_from_metadata};
use burrow::pipeline::{BackupSession, RunSummary, run_backup};
use burrow::storage::{DirectoryStore, UploadService};
use burrow::types::{FileInfo, FileRecord, Settings};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Walker that emits exactly the given paths, in order, stat'ing the real
/// filesystem. Keeps scenario ordering deterministic where a directory walk
/// would not be.
struct ScriptedWalker {
    files: Vec<PathBuf>,
}

impl Walker for ScriptedWalker {
    fn walk(&self, root: &Path, on_file: &mut dyn FnMut(FileRecord) -> Result<()>) -> Result<()> {
        for path in &self.files {
            if !path.starts_with(root) || !path.exists() {
                continue;
            }
            let meta = std::fs::symlink_metadata(path)?;
            on_file(FileRecord {
                path: path.clone(),
                info: file_info_from_metadata(&meta),
            })?;
        }
        Ok(())
    }
}

/// Per-path open counts, shared between the test and its opener.
#[derive(Default)]
struct OpenLog {
    counts: Mutex<HashMap<PathBuf, usize>>,
}

impl OpenLog {
    fn opens(&self, path: &Path) -> usize {
        *self.counts.lock().unwrap().get(path).unwrap_or(&0)
    }

    fn total(&self) -> usize {
        self.counts.lock().unwrap().values().sum()
    }
}

/// Opener wrapping the OS one: counts opens, optionally fails some paths,
/// optionally substitutes content from the Nth open of one path onward
/// (files mutating under the pipeline).
struct TestOpener {
    inner: OsFileOpener,
    log: Arc<OpenLog>,
    fail_paths: Vec<PathBuf>,
    override_content: Option<(PathBuf, usize, Vec<u8>)>,
}

impl TestOpener {
    fn counting(log: &Arc<OpenLog>) -> Self {
        Self {
            inner: OsFileOpener,
            log: Arc::clone(log),
            fail_paths: Vec::new(),
            override_content: None,
        }
    }
}

impl FileOpener for TestOpener {
    fn stat(&self, path: &Path) -> std::io::Result<FileInfo> {
        self.inner.stat(path)
    }

    fn open(&self, path: &Path) -> std::io::Result<Box<dyn Read + Send>> {
        let nth = {
            let mut counts = self.log.counts.lock().unwrap();
            let entry = counts.entry(path.to_path_buf()).or_default();
            *entry += 1;
            *entry
        };
        if self.fail_paths.iter().any(|p| p == path) {
            return Err(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "injected open failure",
            ));
        }
        if let Some((target, from_nth, content)) = &self.override_content
            && target == path
            && nth >= *from_nth
        {
            return Ok(Box::new(std::io::Cursor::new(content.clone())));
        }
        self.inner.open(path)
    }
}

struct TestEnv {
    _tmp: TempDir,
    root: PathBuf,
    catalog_path: PathBuf,
    store_dir: PathBuf,
}

impl TestEnv {
    fn new() -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("root");
        std::fs::create_dir_all(&root).unwrap();
        let catalog_path = tmp.path().join("catalog.db");
        let store_dir = tmp.path().join("store");
        Self {
            _tmp: tmp,
            root,
            catalog_path,
            store_dir,
        }
    }

    fn write(&self, rel: &str, content: &[u8]) -> PathBuf {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, content).unwrap();
        path
    }

    fn run(
        &self,
        walk_order: &[PathBuf],
        opener: TestOpener,
        settings: Settings,
    ) -> Result<RunSummary> {
        let session = Arc::new(BackupSession::new(
            Catalog::at(&self.catalog_path),
            settings,
            Box::new(ScriptedWalker {
                files: walk_order.to_vec(),
            }),
            Box::new(opener),
        ));
        let store_dir = self.store_dir.clone();
        let factory = move || -> Result<Box<dyn UploadService>> {
            Ok(Box::new(DirectoryStore::open(&store_dir)?))
        };
        run_backup(session, &[self.root.clone()], &factory)
    }

    fn sql(&self) -> rusqlite::Connection {
        rusqlite::Connection::open(&self.catalog_path).unwrap()
    }

    fn count(&self, sql: &str) -> i64 {
        self.sql().query_row(sql, [], |row| row.get(0)).unwrap()
    }

    fn current_hash(&self, path: &Path) -> Option<[u8; 32]> {
        self.sql()
            .query_row(
                "SELECT hash FROM files WHERE path = ?1 AND end IS NULL",
                [path.to_string_lossy()],
                |row| row.get::<_, Vec<u8>>(0),
            )
            .map(|h| {
                let mut hash = [0u8; 32];
                hash.copy_from_slice(&h);
                Some(hash)
            })
            .unwrap_or(None)
    }

    /// Finished blob files in the store (temp files excluded).
    fn stored_blobs(&self) -> Vec<PathBuf> {
        let mut blobs = Vec::new();
        for entry in walkdir::WalkDir::new(&self.store_dir) {
            let entry = entry.unwrap();
            if entry.file_type().is_file()
                && !entry.file_name().to_string_lossy().starts_with("tmp-")
            {
                blobs.push(entry.into_path());
            }
        }
        blobs
    }
}

fn test_settings() -> Settings {
    Settings {
        num_hasher_threads: 1,
        num_uploader_threads: 1,
        upload_status_interval_seconds: -1,
        ..Settings::default()
    }
}

fn sha(content: &[u8]) -> [u8; 32] {
    Sha256::digest(content).into()
}

// --- S1: unique size fast path ---

#[test]
fn test_unique_sizes_skip_hashing() {
    let env = TestEnv::new();
    let a = env.write("a", &[b'a'; 27]);
    let b = env.write("b", &[b'b'; 28]);
    let log = Arc::new(OpenLog::default());

    env.run(
        &[a.clone(), b.clone()],
        TestOpener::counting(&log),
        test_settings(),
    )
    .unwrap();

    // One open each: the uploader. The hasher never saw either file.
    assert_eq!(log.opens(&a), 1);
    assert_eq!(log.opens(&b), 1);

    assert_eq!(env.count("SELECT COUNT(*) FROM blobs"), 1);
    assert_eq!(env.count("SELECT COUNT(*) FROM blob_entries"), 2);
    assert_eq!(
        env.count("SELECT COUNT(*) FROM files WHERE end IS NULL"),
        2
    );
    assert_eq!(env.current_hash(&a), Some(sha(&[b'a'; 27])));
    assert_eq!(env.current_hash(&b), Some(sha(&[b'b'; 28])));

    // Blob integrity: stored bytes hash to the catalog's final_hash.
    let blobs = env.stored_blobs();
    assert_eq!(blobs.len(), 1);
    let stored = std::fs::read(&blobs[0]).unwrap();
    let final_hash: Vec<u8> = env
        .sql()
        .query_row("SELECT final_hash FROM blobs", [], |row| row.get(0))
        .unwrap();
    assert_eq!(sha(&stored).to_vec(), final_hash);
}

// --- S2: same size, different content ---

#[test]
fn test_same_size_different_content_serializes_on_claim() {
    let env = TestEnv::new();
    let a = env.write("a", &[b'1'; 32]);
    let b = env.write("b", &[b'2'; 32]);
    let log = Arc::new(OpenLog::default());

    env.run(
        &[a.clone(), b.clone()],
        TestOpener::counting(&log),
        test_settings(),
    )
    .unwrap();

    // `a` staked and went straight to upload; `b` was hashed, blocked on the
    // claim, then uploaded in a second blob.
    assert_eq!(log.opens(&a), 1);
    assert_eq!(log.opens(&b), 2);
    assert_eq!(env.count("SELECT COUNT(*) FROM blobs"), 2);
    assert_eq!(env.count("SELECT COUNT(*) FROM blob_entries"), 2);
    assert_eq!(
        env.count("SELECT COUNT(*) FROM files WHERE end IS NULL"),
        2
    );
}

// --- S3: dedup across directories ---

#[test]
fn test_identical_content_shares_one_entry() {
    let env = TestEnv::new();
    let content = b"same bytes in two places".to_vec();
    let a = env.write("dir1/a", &content);
    let b = env.write("dir2/b", &content);
    let log = Arc::new(OpenLog::default());

    env.run(
        &[a.clone(), b.clone()],
        TestOpener::counting(&log),
        test_settings(),
    )
    .unwrap();

    // `a` was read once as the upload source, `b` once by the hasher.
    assert_eq!(log.opens(&a), 1);
    assert_eq!(log.opens(&b), 1);
    assert_eq!(env.count("SELECT COUNT(*) FROM blob_entries"), 1);
    assert_eq!(
        env.count("SELECT COUNT(*) FROM files WHERE end IS NULL"),
        2
    );
    assert_eq!(env.current_hash(&a), Some(sha(&content)));
    assert_eq!(env.current_hash(&b), Some(sha(&content)));
}

// --- S4: file grows between hash and upload ---

#[test]
fn test_grown_file_revives_next_waiter() {
    let env = TestEnv::new();
    let content_x = vec![b'x'; 32];
    let content_y = vec![b'y'; 32];
    let grown = vec![b'y'; 64];
    let f0 = env.write("f0", &content_x);
    let f1 = env.write("f1", &content_y);
    let f2 = env.write("f2", &content_y);
    let f3 = env.write("f3", &content_y);
    let log = Arc::new(OpenLog::default());

    // f1's second open (the uploader's read) sees the grown content.
    let opener = TestOpener {
        inner: OsFileOpener,
        log: Arc::clone(&log),
        fail_paths: Vec::new(),
        override_content: Some((f1.clone(), 2, grown.clone())),
    };

    env.run(
        &[f0.clone(), f1.clone(), f2.clone(), f3.clone()],
        opener,
        test_settings(),
    )
    .unwrap();

    // f1 committed against what it actually contained; f2 was revived as the
    // new source for the shared hash; f3 rode along as its latecomer.
    assert_eq!(env.current_hash(&f0), Some(sha(&content_x)));
    assert_eq!(env.current_hash(&f1), Some(sha(&grown)));
    assert_eq!(env.current_hash(&f2), Some(sha(&content_y)));
    assert_eq!(env.current_hash(&f3), Some(sha(&content_y)));
    assert_eq!(
        env.count("SELECT COUNT(*) FROM files WHERE end IS NULL"),
        4
    );
    assert_eq!(env.count("SELECT COUNT(*) FROM blob_entries"), 3);

    // f2 was read by the hasher and again by its revival upload; f3 only by
    // the hasher.
    assert_eq!(log.opens(&f1), 2);
    assert_eq!(log.opens(&f2), 2);
    assert_eq!(log.opens(&f3), 1);
}

// --- S5: staked item unreadable at upload ---

#[test]
fn test_unreadable_staked_file_releases_claim() {
    let env = TestEnv::new();
    let a = env.write("a", &[b'a'; 40]);
    let b = env.write("b", &[b'b'; 40]);
    let log = Arc::new(OpenLog::default());

    let opener = TestOpener {
        inner: OsFileOpener,
        log: Arc::clone(&log),
        fail_paths: vec![a.clone()],
        override_content: None,
    };

    env.run(&[a.clone(), b.clone()], opener, test_settings())
        .unwrap();

    // Only `b` is recorded; `a`'s claim was released so `b` could proceed.
    assert_eq!(
        env.count("SELECT COUNT(*) FROM files WHERE end IS NULL"),
        1
    );
    assert_eq!(env.current_hash(&b), Some(sha(&[b'b'; 40])));
    assert_eq!(env.count("SELECT COUNT(*) FROM blob_entries"), 1);
    assert_eq!(env.count("SELECT COUNT(*) FROM blobs"), 1);
    // The cancelled blob left nothing behind in the store.
    assert_eq!(env.stored_blobs().len(), 1);
}

// --- S6: unchanged files cost one stat ---

#[test]
fn test_second_run_opens_nothing_when_unchanged() {
    let env = TestEnv::new();
    let a = env.write("a", b"first file");
    let b = env.write("b", b"second file!");
    let order = [a.clone(), b.clone()];

    let log1 = Arc::new(OpenLog::default());
    env.run(&order, TestOpener::counting(&log1), test_settings())
        .unwrap();
    let blobs_after_first = env.count("SELECT COUNT(*) FROM blobs");
    let rows_after_first = env.count("SELECT COUNT(*) FROM files");

    let log2 = Arc::new(OpenLog::default());
    let summary = env
        .run(&order, TestOpener::counting(&log2), test_settings())
        .unwrap();

    assert_eq!(log2.total(), 0, "no file was opened on the second run");
    assert_eq!(summary.unchanged, 2);
    assert_eq!(env.count("SELECT COUNT(*) FROM blobs"), blobs_after_first);
    assert_eq!(env.count("SELECT COUNT(*) FROM files"), rows_after_first);
}

// --- S7: deletion pruning ---

#[test]
fn test_deleted_path_is_pruned() {
    let env = TestEnv::new();
    let deleted = env.write("deleted.txt", b"going away");
    let remains = env.write("remains.txt", b"staying put here");

    env.run(
        &[deleted.clone(), remains.clone()],
        TestOpener::counting(&Arc::new(OpenLog::default())),
        test_settings(),
    )
    .unwrap();

    std::fs::remove_file(&deleted).unwrap();

    let log = Arc::new(OpenLog::default());
    let summary = env
        .run(&[remains.clone()], TestOpener::counting(&log), test_settings())
        .unwrap();

    assert_eq!(log.total(), 0, "second run opened no files");
    assert_eq!(summary.pruned, 1);
    assert_eq!(env.current_hash(&deleted), None);
    // The deleted path keeps its history row, now ended.
    assert_eq!(
        env.count("SELECT COUNT(*) FROM files WHERE end IS NOT NULL"),
        1
    );
    assert_eq!(env.current_hash(&remains), Some(sha(b"staying put here")));
}

// --- concurrency smoke: pools wider than one ---

#[test]
fn test_wider_pools_reach_the_same_state() {
    let env = TestEnv::new();
    let mut order = Vec::new();
    for i in 0..20 {
        // Half the files share content pairwise, half are unique.
        let content = format!("file number {} padded to be compressible", i / 2);
        order.push(env.write(&format!("f{i}"), content.as_bytes()));
    }
    let settings = Settings {
        num_hasher_threads: 4,
        num_uploader_threads: 2,
        upload_status_interval_seconds: -1,
        ..Settings::default()
    };

    env.run(
        &order,
        TestOpener::counting(&Arc::new(OpenLog::default())),
        settings,
    )
    .unwrap();

    assert_eq!(
        env.count("SELECT COUNT(*) FROM files WHERE end IS NULL"),
        20
    );
    // Pairwise-identical content dedups to one entry per distinct hash.
    assert_eq!(env.count("SELECT COUNT(*) FROM blob_entries"), 10);
}
