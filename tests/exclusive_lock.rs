//! # Exclusive-Lock Protocol Tests
//!
//! The consolidation side of the lock manager: exclusive acquisition
//! drains readers first, strict xlock/xunlock pairing, and the
//! metadata-level consolidation that runs under the lock.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use common::*;
use tempfile::tempdir;
use tessera::{storage_error, StorageError};

#[test]
fn xlock_then_xunlock_is_a_noop_on_observable_state() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let uri = array_uri(dir.path(), "a");
    let key = no_key();
    create_array(&sm, &uri, &key);

    sm.array_xlock(&uri).unwrap();
    sm.array_xunlock(&uri).unwrap();

    // Readers and a second exclusive round still work.
    sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    sm.array_close_for_reads(&uri).unwrap();
    sm.array_xlock(&uri).unwrap();
    sm.array_xunlock(&uri).unwrap();
}

#[test]
fn xunlock_without_xlock_fails() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let uri = array_uri(dir.path(), "a");
    create_array(&sm, &uri, &no_key());

    let err = sm.array_xunlock(&uri).unwrap_err();
    assert!(matches!(
        storage_error(&err),
        Some(StorageError::LockFailure { .. })
    ));
}

#[test]
fn xlock_drains_readers_before_proceeding() {
    let dir = tempdir().unwrap();
    let sm = Arc::new(manager());
    let uri = array_uri(dir.path(), "a");
    let key = no_key();
    create_array(&sm, &uri, &key);
    commit_fragment(&sm, &uri, "__f_1", 1, false, &[(0, 9)], &key);

    sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();

    let locked = Arc::new(AtomicBool::new(false));
    let locker = {
        let sm = Arc::clone(&sm);
        let uri = uri.clone();
        let locked = Arc::clone(&locked);
        thread::spawn(move || {
            sm.array_xlock(&uri).unwrap();
            locked.store(true, Ordering::Release);
            sm.array_xunlock(&uri).unwrap();
        })
    };

    // The exclusive locker must block while the reader is open.
    thread::sleep(Duration::from_millis(100));
    assert!(!locked.load(Ordering::Acquire));

    sm.array_close_for_reads(&uri).unwrap();
    locker.join().unwrap();
    assert!(locked.load(Ordering::Acquire));
}

#[test]
fn readers_blocked_while_exclusive_lock_held() {
    let dir = tempdir().unwrap();
    let sm = Arc::new(manager());
    let uri = array_uri(dir.path(), "a");
    let key = no_key();
    create_array(&sm, &uri, &key);

    sm.array_xlock(&uri).unwrap();

    let opened = Arc::new(AtomicBool::new(false));
    let reader = {
        let sm = Arc::clone(&sm);
        let uri = uri.clone();
        let key = key.clone();
        let opened = Arc::clone(&opened);
        thread::spawn(move || {
            sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
            opened.store(true, Ordering::Release);
            sm.array_close_for_reads(&uri).unwrap();
        })
    };

    thread::sleep(Duration::from_millis(100));
    assert!(!opened.load(Ordering::Acquire));

    sm.array_xunlock(&uri).unwrap();
    reader.join().unwrap();
    assert!(opened.load(Ordering::Acquire));
}

#[test]
fn consolidate_merges_fragments_into_one() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let uri = array_uri(dir.path(), "a");
    let key = no_key();
    create_array(&sm, &uri, &key);
    commit_fragment(&sm, &uri, "__f_10", 10, false, &[(0, 4)], &key);
    commit_fragment(&sm, &uri, "__f_20", 20, false, &[(5, 9)], &key);
    commit_fragment(&sm, &uri, "__f_30", 30, true, &[(20, 29)], &key);

    sm.array_consolidate(uri.as_str(), &key).unwrap();

    let (schema, fragments) = sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    assert_eq!(fragments.len(), 1);
    let merged = &fragments[0];

    // Newest source timestamp, unioned domain, summed sizes; one
    // sparse source makes the merged fragment sparse.
    assert_eq!(merged.timestamp(), 30);
    assert!(merged.sparse());
    assert_eq!(merged.fragment_size(), 3 * 1024);
    assert_eq!(
        merged.non_empty_domain(),
        tessera::array::range_from_i64(tessera::Datatype::Int64, &[(0, 29)])
    );

    let domain = sm
        .array_non_empty_domain(&uri, &schema, &fragments)
        .unwrap()
        .unwrap();
    assert_eq!(
        domain,
        tessera::array::range_from_i64(tessera::Datatype::Int64, &[(0, 29)])
    );
    sm.array_close_for_reads(&uri).unwrap();

    // Consolidating a single fragment is a no-op.
    sm.array_consolidate(uri.as_str(), &key).unwrap();
    let (_, fragments) = sm.array_open_for_reads(&uri, u64::MAX, &key).unwrap();
    assert_eq!(fragments.len(), 1);
    sm.array_close_for_reads(&uri).unwrap();
}

#[test]
fn consolidate_missing_array_is_not_found() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let uri = array_uri(dir.path(), "nope");

    let err = sm.array_consolidate(uri.as_str(), &no_key()).unwrap_err();
    assert!(matches!(
        storage_error(&err),
        Some(StorageError::NotFound(_))
    ));
}

#[test]
fn consolidated_data_remains_visible_at_old_snapshots_cutoff() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let uri = array_uri(dir.path(), "a");
    let key = no_key();
    create_array(&sm, &uri, &key);
    commit_fragment(&sm, &uri, "__f_10", 10, false, &[(0, 4)], &key);
    commit_fragment(&sm, &uri, "__f_20", 20, false, &[(5, 9)], &key);

    sm.array_consolidate(uri.as_str(), &key).unwrap();

    // Before the merged timestamp nothing is visible; at it, the
    // merged fragment is.
    let (_, fragments) = sm.array_open_for_reads(&uri, 19, &key).unwrap();
    assert!(fragments.is_empty());
    sm.array_close_for_reads(&uri).unwrap();

    let (_, fragments) = sm.array_open_for_reads(&uri, 20, &key).unwrap();
    assert_eq!(fragments.len(), 1);
    assert_eq!(fragments[0].timestamp(), 20);
    sm.array_close_for_reads(&uri).unwrap();
}
