//! Record store and advisory lock behaviour against real files.

use std::fs;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use meshllm::storage::lock::sentinel_path;
use meshllm::storage::{FileLock, LockOptions, Record, RecordStore, StoreError};
use tempfile::tempdir;

const SCHEMA: [&str; 3] = ["processed", "id", "body"];

fn fast_lock() -> LockOptions {
    LockOptions {
        timeout: Duration::from_millis(200),
        poll_interval: Duration::from_millis(5),
        stale_after: None,
    }
}

fn row(id: &str, body: &str) -> Record {
    let mut r = Record::new();
    r.insert("id".into(), id.into());
    r.insert("body".into(), body.into());
    r
}

#[test]
fn test_multiline_and_quoted_fields_round_trip() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("log.csv");
    let store = RecordStore::new(fast_lock());

    let body = "line one\nline two, with comma\r\n\"quoted\" and back\\slash";
    store.append(&path, &SCHEMA, &row("1", body)).unwrap();
    store.append(&path, &SCHEMA, &row("2", " padded ")).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert_eq!(text.lines().count(), 3, "one physical line per record plus header");

    let records = store.read(&path).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["body"], body);
    assert_eq!(records[1]["body"], " padded ");
    // missing processed normalizes to "0"
    assert_eq!(records[0]["processed"], "0");
}

#[test]
fn test_read_missing_file_is_empty() {
    let tmp = tempdir().unwrap();
    let store = RecordStore::new(fast_lock());
    assert!(store.read(&tmp.path().join("nope.csv")).unwrap().is_empty());
}

#[test]
fn test_schema_migration_keeps_shared_columns() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("log.csv");
    fs::write(&path, "id,legacy,body\n7,x,hello\n").unwrap();

    let store = RecordStore::new(fast_lock());
    store.ensure(&path, &SCHEMA).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.starts_with("processed,id,body\n"));
    let records = store.read(&path).unwrap();
    assert_eq!(records[0]["id"], "7");
    assert_eq!(records[0]["body"], "hello");
    assert!(!records[0].contains_key("legacy"));
}

#[test]
fn test_update_skips_rewrite_when_unchanged() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("log.csv");
    let store = RecordStore::new(fast_lock());
    store.append(&path, &SCHEMA, &row("1", "a")).unwrap();
    let before = fs::metadata(&path).unwrap().modified().unwrap();

    thread::sleep(Duration::from_millis(20));
    let count = store
        .update(&path, &SCHEMA, |rows: &mut Vec<Record>| Ok::<_, StoreError>((false, rows.len())))
        .unwrap();
    assert_eq!(count, 1);
    assert_eq!(fs::metadata(&path).unwrap().modified().unwrap(), before);

    store
        .update(&path, &SCHEMA, |rows: &mut Vec<Record>| {
            rows[0].insert("processed".into(), "1".into());
            Ok::<_, StoreError>((true, ()))
        })
        .unwrap();
    assert_eq!(store.read(&path).unwrap()[0]["processed"], "1");
    assert!(!sentinel_path(&path).exists(), "lock released after update");
}

#[test]
fn test_held_lock_times_out() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("log.csv");
    let store = RecordStore::new(fast_lock());

    let guard = FileLock::for_target(&path, fast_lock()).acquire().unwrap();
    let err = store.append(&path, &SCHEMA, &row("1", "a")).unwrap_err();
    assert!(err.is_lock_timeout(), "{}", err);
    drop(guard);

    store.append(&path, &SCHEMA, &row("1", "a")).unwrap();
}

#[test]
fn test_stale_sentinel_is_broken() {
    let tmp = tempdir().unwrap();
    let path = tmp.path().join("log.csv");
    fs::write(sentinel_path(&path), "99999\n").unwrap();

    let opts = LockOptions {
        stale_after: Some(Duration::ZERO),
        ..fast_lock()
    };
    let guard = FileLock::for_target(&path, opts).acquire().unwrap();
    assert!(sentinel_path(&path).exists());
    guard.release();
    assert!(!sentinel_path(&path).exists());
}

#[test]
fn test_concurrent_appends_are_not_lost() {
    let tmp = tempdir().unwrap();
    let path = Arc::new(tmp.path().join("log.csv"));
    let opts = LockOptions {
        timeout: Duration::from_secs(5),
        ..fast_lock()
    };
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let path = Arc::clone(&path);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                let store = RecordStore::new(opts);
                barrier.wait();
                for i in 0..10 {
                    store
                        .update(&path, &SCHEMA, |rows: &mut Vec<Record>| {
                            rows.push(row(&format!("{}-{}", t, i), "x"));
                            Ok::<_, StoreError>((true, ()))
                        })
                        .unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    let records = RecordStore::new(opts).read(&path).unwrap();
    assert_eq!(records.len(), 40);
}
