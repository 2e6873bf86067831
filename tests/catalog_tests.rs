//! Catalog adapter tests: row lifecycle, size lookups, and the atomic blob
//! commit.

use burrow::catalog::{BlobEntryRow, BlobMeta, CatalogConn, FileRowWrite};
use burrow::storage::StorageCompletion;
use std::path::Path;

fn hash(byte: u8) -> [u8; 32] {
    [byte; 32]
}

fn conn_with_size(h: [u8; 32], size: u64) -> CatalogConn {
    let conn = CatalogConn::open_in_memory().unwrap();
    conn.insert_size(&h, size).unwrap();
    conn
}

#[test]
fn test_lookup_current_missing_path() {
    let conn = CatalogConn::open_in_memory().unwrap();
    assert_eq!(conn.lookup_current(Path::new("/r/a")).unwrap(), None);
}

#[test]
fn test_insert_then_lookup_current() {
    let conn = conn_with_size(hash(1), 27);
    conn.end_current_and_insert(Path::new("/r/a"), &hash(1), 1000, 0o644, 500)
        .unwrap();

    let row = conn.lookup_current(Path::new("/r/a")).unwrap().unwrap();
    assert_eq!(row.hash, hash(1));
    assert_eq!(row.size, 27);
    assert_eq!(row.fs_modified, 1000);
}

#[test]
fn test_end_current_and_insert_keeps_one_current_row() {
    let conn = conn_with_size(hash(1), 27);
    conn.insert_size(&hash(2), 31).unwrap();

    conn.end_current_and_insert(Path::new("/r/a"), &hash(1), 1000, 0o644, 500)
        .unwrap();
    conn.end_current_and_insert(Path::new("/r/a"), &hash(2), 2000, 0o644, 900)
        .unwrap();

    // New content is current; the old version is history, not gone.
    let row = conn.lookup_current(Path::new("/r/a")).unwrap().unwrap();
    assert_eq!(row.hash, hash(2));
    assert_eq!(row.size, 31);
}

#[test]
fn test_touch_current_updates_metadata_only() {
    let conn = conn_with_size(hash(1), 27);
    conn.end_current_and_insert(Path::new("/r/a"), &hash(1), 1000, 0o644, 500)
        .unwrap();
    conn.touch_current(Path::new("/r/a"), 1234, 0o600).unwrap();

    let row = conn.lookup_current(Path::new("/r/a")).unwrap().unwrap();
    assert_eq!(row.hash, hash(1));
    assert_eq!(row.fs_modified, 1234);
}

#[test]
fn test_any_hash_for_size() {
    let conn = conn_with_size(hash(1), 27);
    assert_eq!(conn.any_hash_for_size(27).unwrap(), Some(hash(1)));
    assert_eq!(conn.any_hash_for_size(28).unwrap(), None);
}

#[test]
fn test_insert_size_is_idempotent() {
    let conn = conn_with_size(hash(1), 27);
    conn.insert_size(&hash(1), 27).unwrap();
    assert_eq!(conn.any_hash_for_size(27).unwrap(), Some(hash(1)));
}

#[test]
fn test_end_current_marks_deleted() {
    let conn = conn_with_size(hash(1), 27);
    conn.end_current_and_insert(Path::new("/r/a"), &hash(1), 1000, 0o644, 500)
        .unwrap();
    conn.end_current(Path::new("/r/a"), 900).unwrap();
    assert_eq!(conn.lookup_current(Path::new("/r/a")).unwrap(), None);
}

#[test]
fn test_list_current_under_respects_separator_boundary() {
    let conn = conn_with_size(hash(1), 27);
    for path in ["/r/a", "/r/sub/b", "/rx/c"] {
        conn.end_current_and_insert(Path::new(path), &hash(1), 1000, 0o644, 500)
            .unwrap();
    }
    conn.end_current(Path::new("/r/sub/b"), 600).unwrap();

    let mut under = conn.list_current_under(Path::new("/r/")).unwrap();
    under.sort();
    assert_eq!(under, vec!["/r/a".to_string()]);
}

#[test]
fn test_commit_blob_writes_all_rows_atomically() {
    let conn = CatalogConn::open_in_memory().unwrap();
    let blob = BlobMeta {
        blob_id: [9u8; 32],
        padding_key: [7u8; 16],
        size: 4096,
        final_hash: hash(99),
    };
    let completions = vec![
        StorageCompletion {
            storage_id: "dir:/dst1".into(),
            path: "ab/abcd".into(),
            checksum: "feed".into(),
            size: 4096,
        },
        StorageCompletion {
            storage_id: "dir:/dst2".into(),
            path: "ab/abcd".into(),
            checksum: "feed".into(),
            size: 4096,
        },
    ];
    let entries = vec![
        BlobEntryRow {
            hash: hash(1),
            size: 27,
            offset: 0,
            final_size: 30,
            encryption_key: [1u8; 16],
            compression_alg: Some("zstd".into()),
        },
        BlobEntryRow {
            hash: hash(2),
            size: 28,
            offset: 30,
            final_size: 28,
            encryption_key: [2u8; 16],
            compression_alg: None,
        },
    ];
    let files = vec![
        FileRowWrite {
            path: "/r/a".into(),
            hash: hash(1),
            fs_modified: 1000,
            permissions: 0o644,
        },
        FileRowWrite {
            path: "/r/b".into(),
            hash: hash(2),
            fs_modified: 1001,
            permissions: 0o600,
        },
    ];

    conn.commit_blob(&blob, &completions, &entries, &files, 777)
        .unwrap();

    assert!(conn.hash_is_stored(&hash(1)).unwrap());
    assert!(conn.hash_is_stored(&hash(2)).unwrap());
    assert!(!conn.hash_is_stored(&hash(3)).unwrap());
    assert_eq!(conn.any_hash_for_size(27).unwrap(), Some(hash(1)));

    let row = conn.lookup_current(Path::new("/r/a")).unwrap().unwrap();
    assert_eq!(row.hash, hash(1));
    let row = conn.lookup_current(Path::new("/r/b")).unwrap().unwrap();
    assert_eq!(row.hash, hash(2));
}

#[test]
fn test_commit_blob_replaces_current_rows() {
    let conn = conn_with_size(hash(1), 27);
    conn.end_current_and_insert(Path::new("/r/a"), &hash(1), 1000, 0o644, 500)
        .unwrap();

    let blob = BlobMeta {
        blob_id: [8u8; 32],
        padding_key: [7u8; 16],
        size: 128,
        final_hash: hash(98),
    };
    let entries = vec![BlobEntryRow {
        hash: hash(5),
        size: 30,
        offset: 0,
        final_size: 30,
        encryption_key: [5u8; 16],
        compression_alg: None,
    }];
    let files = vec![FileRowWrite {
        path: "/r/a".into(),
        hash: hash(5),
        fs_modified: 2000,
        permissions: 0o644,
    }];
    conn.commit_blob(&blob, &[], &entries, &files, 900).unwrap();

    let row = conn.lookup_current(Path::new("/r/a")).unwrap().unwrap();
    assert_eq!(row.hash, hash(5), "commit replaced the current row");
    assert_eq!(row.size, 30);
}
