//! # Open-Array Registry Entry
//!
//! One [`OpenArray`] exists per (URI, query type) while any caller holds
//! the array open. The storage manager interns entries in its registries
//! and callers share them through `Arc`; everything expensive the entry
//! caches (schema, fragment metadata) outlives individual opens and dies
//! with the entry.
//!
//! ## Locking
//!
//! - `mtx` is the per-entry mutex. The manager holds it across schema
//!   load and fragment selection, and for every ref-count mutation.
//! - The fragment memo map has its own `RwLock` because the parallel
//!   metadata loader inserts from several reader threads while the
//!   opener still holds `mtx`.
//! - The shared filelock handle is held while `cnt > 0` (reads only)
//!   and released before the entry is destroyed.
//!
//! ## Invariants
//!
//! - `cnt` equals the number of unmatched opens.
//! - The schema, once set, is never replaced.
//! - The first encryption key presented wins; any later open with a
//!   different key fails with `EncryptionMismatch`.

use std::fs::File;
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};

use super::{ArraySchema, EncryptionKey, FragmentMetadata};
use crate::config::FILELOCK_NAME;
use crate::error::StorageError;
use crate::query::QueryType;
use crate::uri::Uri;
use crate::vfs::Vfs;

pub struct OpenArray {
    array_uri: Uri,
    query_type: QueryType,
    /// Per-entry mutex; see the module docs for what it serializes.
    pub(crate) mtx: Mutex<()>,
    cnt: Mutex<u64>,
    schema: RwLock<Option<Arc<ArraySchema>>>,
    fragment_metadata: RwLock<HashMap<String, Arc<FragmentMetadata>>>,
    encryption_key: Mutex<Option<EncryptionKey>>,
    filelock: Mutex<Option<File>>,
}

impl OpenArray {
    pub fn new(array_uri: Uri, query_type: QueryType) -> Self {
        Self {
            array_uri,
            query_type,
            mtx: Mutex::new(()),
            cnt: Mutex::new(0),
            schema: RwLock::new(None),
            fragment_metadata: RwLock::new(HashMap::new()),
            encryption_key: Mutex::new(None),
            filelock: Mutex::new(None),
        }
    }

    pub fn array_uri(&self) -> &Uri {
        &self.array_uri
    }

    pub fn query_type(&self) -> QueryType {
        self.query_type
    }

    pub fn cnt(&self) -> u64 {
        *self.cnt.lock()
    }

    pub fn cnt_incr(&self) {
        *self.cnt.lock() += 1;
    }

    /// Returns the count after decrementing.
    pub fn cnt_decr(&self) -> u64 {
        let mut cnt = self.cnt.lock();
        debug_assert!(*cnt > 0, "close without matching open");
        *cnt = cnt.saturating_sub(1);
        *cnt
    }

    pub fn array_schema(&self) -> Option<Arc<ArraySchema>> {
        self.schema.read().clone()
    }

    pub fn set_array_schema(&self, schema: Arc<ArraySchema>) {
        let mut slot = self.schema.write();
        debug_assert!(slot.is_none(), "schema is immutable once set");
        *slot = Some(schema);
    }

    pub fn fragment_metadata(&self, fragment_uri: &Uri) -> Option<Arc<FragmentMetadata>> {
        self.fragment_metadata
            .read()
            .get(fragment_uri.as_str())
            .cloned()
    }

    pub fn insert_fragment_metadata(&self, metadata: Arc<FragmentMetadata>) {
        self.fragment_metadata
            .write()
            .insert(metadata.fragment_uri().to_string(), metadata);
    }

    /// Records the key on first open; later opens must present the same
    /// type and bytes.
    pub fn set_or_check_encryption_key(&self, key: &EncryptionKey) -> Result<()> {
        let mut slot = self.encryption_key.lock();
        match slot.as_ref() {
            None => {
                *slot = Some(key.clone());
                Ok(())
            }
            Some(existing) if existing == key => Ok(()),
            Some(_) => Err(StorageError::EncryptionMismatch(self.array_uri.to_string()).into()),
        }
    }

    /// Acquires the shared filelock if this entry does not hold one yet.
    pub fn file_lock(&self, vfs: &Vfs) -> Result<()> {
        let mut slot = self.filelock.lock();
        if slot.is_none() {
            let lock_uri = self.array_uri.join_path(FILELOCK_NAME);
            *slot = Some(vfs.filelock_lock(&lock_uri, true)?);
        }
        Ok(())
    }

    /// Releases the shared filelock if held. A no-op otherwise, so
    /// rollback paths can call it unconditionally.
    pub fn file_unlock(&self, vfs: &Vfs) -> Result<()> {
        let mut slot = self.filelock.lock();
        if let Some(handle) = slot.take() {
            let lock_uri = self.array_uri.join_path(FILELOCK_NAME);
            vfs.filelock_unlock(&lock_uri, &handle)?;
        }
        Ok(())
    }

    pub fn holds_filelock(&self) -> bool {
        self.filelock.lock().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::schema::{range_from_i64, ArrayType, Attribute, Datatype, Domain};
    use crate::config::VfsConfig;
    use tempfile::tempdir;

    fn entry() -> OpenArray {
        OpenArray::new(Uri::new("file:///data/a"), QueryType::Read)
    }

    #[test]
    fn refcount_tracks_opens() {
        let oa = entry();
        assert_eq!(oa.cnt(), 0);
        oa.cnt_incr();
        oa.cnt_incr();
        assert_eq!(oa.cnt(), 2);
        assert_eq!(oa.cnt_decr(), 1);
        assert_eq!(oa.cnt_decr(), 0);
    }

    #[test]
    fn first_key_wins() {
        let oa = entry();
        let k1 = EncryptionKey::aes_256_gcm(vec![1; 32]).unwrap();
        let k2 = EncryptionKey::aes_256_gcm(vec![2; 32]).unwrap();

        oa.set_or_check_encryption_key(&k1).unwrap();
        oa.set_or_check_encryption_key(&k1).unwrap();

        let err = oa.set_or_check_encryption_key(&k2).unwrap_err();
        assert!(matches!(
            crate::error::storage_error(&err),
            Some(StorageError::EncryptionMismatch(_))
        ));
    }

    #[test]
    fn schema_set_once_and_shared() {
        let oa = entry();
        assert!(oa.array_schema().is_none());

        let domain = Domain::new(
            Datatype::Int32,
            1,
            range_from_i64(Datatype::Int32, &[(0, 9)]),
        )
        .unwrap();
        let schema = Arc::new(ArraySchema::new(
            ArrayType::Dense,
            domain,
            vec![Attribute::fixed("a", Datatype::Int32)],
        ));
        oa.set_array_schema(Arc::clone(&schema));
        assert!(Arc::ptr_eq(&oa.array_schema().unwrap(), &schema));
    }

    #[test]
    fn fragment_memo_reuses_entries() {
        let oa = entry();
        let frag = Uri::new("file:///data/a/__f_1");
        assert!(oa.fragment_metadata(&frag).is_none());

        let meta = Arc::new(FragmentMetadata::new(frag.clone(), true, 1));
        oa.insert_fragment_metadata(Arc::clone(&meta));
        assert!(Arc::ptr_eq(&oa.fragment_metadata(&frag).unwrap(), &meta));
    }

    #[test]
    fn file_lock_and_unlock_are_idempotent() {
        let dir = tempdir().unwrap();
        let vfs = Vfs::new(VfsConfig::default());
        let array_uri = Uri::new(dir.path().to_string_lossy().to_string());
        vfs.touch(&array_uri.join_path(FILELOCK_NAME)).unwrap();

        let oa = OpenArray::new(array_uri, QueryType::Read);
        assert!(!oa.holds_filelock());
        oa.file_lock(&vfs).unwrap();
        oa.file_lock(&vfs).unwrap();
        assert!(oa.holds_filelock());
        oa.file_unlock(&vfs).unwrap();
        oa.file_unlock(&vfs).unwrap();
        assert!(!oa.holds_filelock());
    }
}
