//! Shared fixtures for the storage-manager integration tests: a small
//! 1-D dense array schema and a helper that commits fragments the way
//! the write path lays them out on disk.
#![allow(dead_code)]

use std::path::Path;

use tessera::array::range_from_i64;
use tessera::config::COORDS_FILENAME;
use tessera::{
    ArraySchema, ArrayType, Attribute, Datatype, Domain, EncryptionKey, FragmentMetadata,
    StorageConfig, StorageManager, Uri,
};

pub fn no_key() -> EncryptionKey {
    EncryptionKey::no_encryption()
}

pub fn manager() -> StorageManager {
    StorageManager::new(StorageConfig::default()).unwrap()
}

pub fn array_uri(dir: &Path, name: &str) -> Uri {
    Uri::new(format!("file://{}/{}", dir.display(), name))
}

pub fn test_schema() -> ArraySchema {
    let domain = Domain::new(
        Datatype::Int64,
        1,
        range_from_i64(Datatype::Int64, &[(0, 999)]),
    )
    .unwrap();
    ArraySchema::new(
        ArrayType::Dense,
        domain,
        vec![
            Attribute::fixed("a", Datatype::Int32),
            Attribute::var("labels", Datatype::Uint8),
        ],
    )
}

pub fn create_array(sm: &StorageManager, uri: &Uri, key: &EncryptionKey) {
    sm.array_create(uri, &test_schema(), key).unwrap();
}

/// Lays a committed fragment down on disk: directory, metadata blob,
/// and the coords sentinel for sparse fragments.
pub fn commit_fragment(
    sm: &StorageManager,
    array_uri: &Uri,
    name: &str,
    timestamp: u64,
    sparse: bool,
    domain: &[(i64, i64)],
    key: &EncryptionKey,
) -> Uri {
    let fragment_uri = array_uri.join_path(name);
    sm.vfs().create_dir(&fragment_uri).unwrap();

    let mut meta = FragmentMetadata::new(fragment_uri.clone(), !sparse, timestamp);
    meta.set_non_empty_domain(range_from_i64(Datatype::Int64, domain));
    meta.set_fragment_size(1024);
    meta.push_attr_size("a", 512, 0);
    meta.push_attr_size("labels", 64, 256);
    meta.store(sm.vfs(), key).unwrap();

    if sparse {
        sm.vfs()
            .touch(&fragment_uri.join_path(COORDS_FILENAME))
            .unwrap();
    }
    fragment_uri
}
