//! # Object Typing and Iteration Tests
//!
//! A small hierarchy of groups and arrays, walked in both orders, plus
//! the object-level remove/move operations.

mod common;

use common::*;
use tempfile::tempdir;
use tessera::{storage_error, ObjectType, StorageError, Uri, WalkOrder};

/// Builds:
///
/// ```text
/// root/               (group)
/// ├── g1/             (group)
/// │   └── a1          (array)
/// ├── a2              (array)
/// └── junk/           (plain directory, not an object)
/// ```
fn build_hierarchy(sm: &tessera::StorageManager, base: &std::path::Path) -> Uri {
    let root = array_uri(base, "root");
    sm.group_create(&root).unwrap();

    let g1 = root.join_path("g1");
    sm.group_create(&g1).unwrap();
    create_array(sm, &g1.join_path("a1"), &no_key());
    create_array(sm, &root.join_path("a2"), &no_key());
    sm.vfs().create_dir(&root.join_path("junk")).unwrap();

    root
}

#[test]
fn object_type_recognizes_sentinels() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let root = build_hierarchy(&sm, dir.path());

    assert_eq!(sm.object_type(&root).unwrap(), ObjectType::Group);
    assert_eq!(
        sm.object_type(&root.join_path("g1")).unwrap(),
        ObjectType::Group
    );
    assert_eq!(
        sm.object_type(&root.join_path("a2")).unwrap(),
        ObjectType::Array
    );
    assert_eq!(
        sm.object_type(&root.join_path("junk")).unwrap(),
        ObjectType::Invalid
    );
    assert_eq!(
        sm.object_type(&root.join_path("absent")).unwrap(),
        ObjectType::Invalid
    );
}

#[test]
fn preorder_walk_parents_before_children() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let root = build_hierarchy(&sm, dir.path());

    let mut iter = sm.object_iter_begin(&root, WalkOrder::Preorder).unwrap();
    let mut visited = Vec::new();
    while let Some((uri, object_type)) = sm.object_iter_next(&mut iter).unwrap() {
        visited.push((uri.last_path_part().to_string(), object_type));
    }

    assert_eq!(
        visited,
        vec![
            ("a2".to_string(), ObjectType::Array),
            ("g1".to_string(), ObjectType::Group),
            ("a1".to_string(), ObjectType::Array),
        ]
    );
}

#[test]
fn postorder_walk_children_before_parents() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let root = build_hierarchy(&sm, dir.path());

    let mut iter = sm.object_iter_begin(&root, WalkOrder::Postorder).unwrap();
    let mut visited = Vec::new();
    while let Some((uri, _)) = sm.object_iter_next(&mut iter).unwrap() {
        visited.push(uri.last_path_part().to_string());
    }

    assert_eq!(visited, vec!["a2", "a1", "g1"]);
}

#[test]
fn non_recursive_walk_stays_at_top_level() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let root = build_hierarchy(&sm, dir.path());

    let mut iter = sm.object_iter_begin_non_recursive(&root).unwrap();
    let mut visited = Vec::new();
    while let Some((uri, _)) = sm.object_iter_next(&mut iter).unwrap() {
        visited.push(uri.last_path_part().to_string());
    }

    assert_eq!(visited, vec!["a2", "g1"]);
}

#[test]
fn group_create_rejects_duplicates() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let group = array_uri(dir.path(), "g");

    sm.group_create(&group).unwrap();
    assert!(sm.is_group(&group).unwrap());
    assert!(sm.group_create(&group).is_err());
}

#[test]
fn object_remove_and_move() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let root = build_hierarchy(&sm, dir.path());

    // Moving an array keeps it openable at the new URI.
    let a2 = root.join_path("a2");
    let a2_new = root.join_path("a2_renamed");
    sm.object_move(a2.as_str(), a2_new.as_str()).unwrap();
    assert_eq!(sm.object_type(&a2_new).unwrap(), ObjectType::Array);
    sm.array_open_for_reads(&a2_new, u64::MAX, &no_key()).unwrap();
    sm.array_close_for_reads(&a2_new).unwrap();

    sm.object_remove(a2_new.as_str()).unwrap();
    assert_eq!(sm.object_type(&a2_new).unwrap(), ObjectType::Invalid);

    // Non-objects are refused.
    let junk = root.join_path("junk");
    let err = sm.object_remove(junk.as_str()).unwrap_err();
    assert!(matches!(
        storage_error(&err),
        Some(StorageError::NotFound(_))
    ));
    let err = sm
        .object_move(junk.as_str(), root.join_path("junk2").as_str())
        .unwrap_err();
    assert!(matches!(
        storage_error(&err),
        Some(StorageError::NotFound(_))
    ));
}

#[test]
fn array_get_encryption_reads_header_without_key() {
    let dir = tempdir().unwrap();
    let sm = manager();
    let uri = array_uri(dir.path(), "a");
    let key = tessera::EncryptionKey::aes_256_gcm(vec![9; 32]).unwrap();
    sm.array_create(&uri, &test_schema(), &key).unwrap();

    let encryption = sm
        .array_get_encryption(&uri, ObjectType::Array)
        .unwrap();
    assert_eq!(encryption, tessera::EncryptionType::Aes256Gcm);
}
