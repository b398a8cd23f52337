//! # Open-Array Protocol
//!
//! Find-or-create in the registry, reference counting, shared
//! filelocks, lazy schema loading, and fragment selection — the open
//! side of the storage manager.
//!
//! ## Open for Reads
//!
//! 1. Validate the scheme and confirm the object is an array.
//! 2. Under the reads-registry mutex, with the exclusive gate held
//!    shared, find or create the entry and verify the encryption key.
//! 3. Lock the entry mutex, bump the ref count, release the registry.
//! 4. Acquire the shared filelock; on failure roll the open back.
//! 5. Load the schema if this entry has none yet.
//! 6. Select fragments at the snapshot and load their metadata in
//!    parallel.
//! 7. Drop the entry mutex. The shared filelock stays until close.
//!
//! Every failure after step 3 unwinds through `array_close_for_reads`,
//! which restores the ref count and removes a fresh entry, so an open
//! that fails leaves no trace.
//!
//! ## Writes
//!
//! Same shape minus the filelock and fragment loading. Cross-writer
//! exclusion is by unique fragment names; only consolidation excludes
//! writers, via the exclusive lock.

use std::sync::Arc;

use eyre::{Result, WrapErr};

use super::StorageManager;
use crate::array::{
    read_generic_blob, read_generic_blob_header, write_generic_blob, ArraySchema, EncryptionKey,
    EncryptionType, FragmentInfo, FragmentMetadata, OpenArray,
};
use crate::config::{ARRAY_SCHEMA_FILENAME, FILELOCK_NAME, KV_SCHEMA_FILENAME};
use crate::error::StorageError;
use crate::object::ObjectType;
use crate::query::QueryType;
use crate::uri::Uri;

/// Which fragments an open should make visible.
enum ToLoad {
    /// Enumerate the array directory and keep fragments at or before
    /// the snapshot timestamp.
    Snapshot(u64),
    /// A pre-computed `(timestamp, uri)` list, e.g. from a prior
    /// `get_fragment_info` call.
    Listed(Vec<(u64, Uri)>),
}

impl StorageManager {
    /// Opens an array for reading at `timestamp`, returning the schema
    /// and the fragment metadata visible at that snapshot, ordered
    /// ascending by `(timestamp, uri)`. Every open must be matched by
    /// an `array_close_for_reads`.
    pub fn array_open_for_reads(
        &self,
        array_uri: &Uri,
        timestamp: u64,
        encryption_key: &EncryptionKey,
    ) -> Result<(Arc<ArraySchema>, Vec<Arc<FragmentMetadata>>)> {
        self.open_for_reads_common(array_uri, encryption_key, ToLoad::Snapshot(timestamp))
    }

    /// Open-for-reads overload that skips enumeration and loads exactly
    /// the given fragments.
    pub fn array_open_for_reads_with_fragments(
        &self,
        array_uri: &Uri,
        fragments: &[FragmentInfo],
        encryption_key: &EncryptionKey,
    ) -> Result<(Arc<ArraySchema>, Vec<Arc<FragmentMetadata>>)> {
        let listed = fragments
            .iter()
            .map(|f| (f.timestamp, f.uri.clone()))
            .collect();
        self.open_for_reads_common(array_uri, encryption_key, ToLoad::Listed(listed))
    }

    fn open_for_reads_common(
        &self,
        array_uri: &Uri,
        encryption_key: &EncryptionKey,
        to_load: ToLoad,
    ) -> Result<(Arc<ArraySchema>, Vec<Arc<FragmentMetadata>>)> {
        let object_type = self.validate_open_target(array_uri)?;

        let open_array: Arc<OpenArray>;
        let entry;
        {
            // Entry creation is mutually exclusive with a pending xlock.
            let _gate = self.xlock_gate.lock_shared();
            let mut reads = self.open_arrays_for_reads.lock();
            match reads.get(array_uri.as_str()) {
                Some(existing) => {
                    existing.set_or_check_encryption_key(encryption_key)?;
                    open_array = Arc::clone(existing);
                }
                None => {
                    let fresh = Arc::new(OpenArray::new(array_uri.clone(), QueryType::Read));
                    fresh.set_or_check_encryption_key(encryption_key)?;
                    reads.insert(array_uri.to_string(), Arc::clone(&fresh));
                    open_array = fresh;
                }
            }
            entry = open_array.mtx.lock();
            open_array.cnt_incr();
        }

        if let Err(e) = open_array.file_lock(&self.vfs) {
            drop(entry);
            let _ = self.array_close_for_reads(array_uri);
            return Err(e);
        }

        if let Err(e) = self.load_schema_into(&open_array, object_type, encryption_key) {
            drop(entry);
            let _ = self.array_close_for_reads(array_uri);
            return Err(e);
        }
        let schema = match open_array.array_schema() {
            Some(schema) => schema,
            None => {
                drop(entry);
                let _ = self.array_close_for_reads(array_uri);
                return Err(
                    StorageError::Internal("schema missing after successful load".into()).into(),
                );
            }
        };

        let loaded = self
            .select_fragments(array_uri, &to_load)
            .and_then(|to_load| {
                self.load_fragment_metadata(&open_array, encryption_key, &to_load)
            });
        match loaded {
            Ok(metadata) => {
                drop(entry);
                // The shared filelock is retained until close.
                Ok((schema, metadata))
            }
            Err(e) => {
                drop(entry);
                let _ = self.array_close_for_reads(array_uri);
                Err(e)
            }
        }
    }

    fn select_fragments(&self, array_uri: &Uri, to_load: &ToLoad) -> Result<Vec<(u64, Uri)>> {
        match to_load {
            ToLoad::Snapshot(timestamp) => {
                let uris = self.fragment_uris(array_uri)?;
                self.sorted_fragment_uris(&uris, *timestamp)
            }
            ToLoad::Listed(listed) => Ok(listed.clone()),
        }
    }

    /// Re-runs fragment selection for an array already open for reads,
    /// with a possibly different snapshot. The entry's ref count is
    /// untouched; a failed reopen leaves the open session intact.
    pub fn array_reopen(
        &self,
        array_uri: &Uri,
        timestamp: u64,
        encryption_key: &EncryptionKey,
    ) -> Result<(Arc<ArraySchema>, Vec<Arc<FragmentMetadata>>)> {
        let open_array: Arc<OpenArray>;
        let entry;
        {
            let mut reads = self.open_arrays_for_reads.lock();
            match reads.get(array_uri.as_str()) {
                Some(existing) => {
                    existing.set_or_check_encryption_key(encryption_key)?;
                    open_array = Arc::clone(existing);
                }
                None => {
                    return Err(StorageError::Internal(format!(
                        "cannot reopen '{array_uri}': array not open for reads"
                    ))
                    .into());
                }
            }
            entry = open_array.mtx.lock();
        }

        let loaded = self
            .select_fragments(array_uri, &ToLoad::Snapshot(timestamp))
            .and_then(|to_load| {
                self.load_fragment_metadata(&open_array, encryption_key, &to_load)
            });
        let metadata = match loaded {
            Ok(metadata) => metadata,
            Err(e) => {
                drop(entry);
                return Err(e);
            }
        };

        let schema = open_array
            .array_schema()
            .ok_or_else(|| StorageError::Internal("open entry has no schema".into()))?;
        drop(entry);
        Ok((schema, metadata))
    }

    /// Closes one read open. A no-op success when the array is not open.
    /// When the last open closes, the shared filelock is released and
    /// the entry destroyed; the xlock condition variable is notified on
    /// every close so pending exclusive lockers re-check the registry.
    pub fn array_close_for_reads(&self, array_uri: &Uri) -> Result<()> {
        let result = {
            let mut reads = self.open_arrays_for_reads.lock();
            match reads.get(array_uri.as_str()).map(Arc::clone) {
                None => return Ok(()),
                Some(open_array) => {
                    let entry = open_array.mtx.lock();
                    let remaining = open_array.cnt_decr();
                    if remaining == 0 {
                        let unlocked = open_array.file_unlock(&self.vfs);
                        drop(entry);
                        reads.remove(array_uri.as_str());
                        unlocked
                    } else {
                        drop(entry);
                        Ok(())
                    }
                }
            }
        };

        self.xlock_cv.notify_all();
        result
    }

    /// Opens an array for writing. No filelock is taken; schema loading
    /// and memoization work as for reads.
    pub fn array_open_for_writes(
        &self,
        array_uri: &Uri,
        encryption_key: &EncryptionKey,
    ) -> Result<Arc<ArraySchema>> {
        let object_type = self.validate_open_target(array_uri)?;

        let open_array: Arc<OpenArray>;
        let entry;
        {
            let mut writes = self.open_arrays_for_writes.lock();
            match writes.get(array_uri.as_str()) {
                Some(existing) => {
                    existing.set_or_check_encryption_key(encryption_key)?;
                    open_array = Arc::clone(existing);
                }
                None => {
                    let fresh = Arc::new(OpenArray::new(array_uri.clone(), QueryType::Write));
                    fresh.set_or_check_encryption_key(encryption_key)?;
                    writes.insert(array_uri.to_string(), Arc::clone(&fresh));
                    open_array = fresh;
                }
            }
            entry = open_array.mtx.lock();
            open_array.cnt_incr();
        }

        if let Err(e) = self.load_schema_into(&open_array, object_type, encryption_key) {
            drop(entry);
            let _ = self.array_close_for_writes(array_uri);
            return Err(e);
        }
        let schema = match open_array.array_schema() {
            Some(schema) => schema,
            None => {
                drop(entry);
                let _ = self.array_close_for_writes(array_uri);
                return Err(
                    StorageError::Internal("schema missing after successful load".into()).into(),
                );
            }
        };

        drop(entry);
        Ok(schema)
    }

    /// Closes one write open. A no-op success when the array is not
    /// open. Writes hold no filelock, so the last close just destroys
    /// the entry.
    pub fn array_close_for_writes(&self, array_uri: &Uri) -> Result<()> {
        let mut writes = self.open_arrays_for_writes.lock();
        if let Some(open_array) = writes.get(array_uri.as_str()).map(Arc::clone) {
            let entry = open_array.mtx.lock();
            let remaining = open_array.cnt_decr();
            drop(entry);
            if remaining == 0 {
                writes.remove(array_uri.as_str());
            }
        }
        Ok(())
    }

    /* ---------------- creation & schema I/O ---------------- */

    /// Creates an array: directory, stored schema, and the filelock
    /// target. Refuses if anything already exists at the URI; rolls the
    /// directory back if a later step fails.
    pub fn array_create(
        &self,
        array_uri: &Uri,
        schema: &ArraySchema,
        encryption_key: &EncryptionKey,
    ) -> Result<()> {
        if array_uri.is_invalid() || !self.vfs.supports_uri_scheme(array_uri) {
            return Err(StorageError::InvalidUri(array_uri.to_string()).into());
        }
        if self.is_array(array_uri)? || self.is_kv(array_uri)? {
            return Err(StorageError::Internal(format!(
                "array '{array_uri}' already exists"
            ))
            .into());
        }

        let _create = self.object_create_mtx.lock();

        let mut schema = schema.clone();
        schema.set_array_uri(array_uri.clone());
        schema.check()?;

        self.vfs.create_dir(array_uri)?;

        if let Err(e) = self.store_array_schema(&schema, encryption_key) {
            let _ = self.vfs.remove_dir(array_uri);
            return Err(e);
        }

        let filelock_uri = array_uri.join_path(FILELOCK_NAME);
        if let Err(e) = self.vfs.touch(&filelock_uri) {
            let _ = self.vfs.remove_dir(array_uri);
            return Err(e);
        }

        tracing::debug!(array = %array_uri, "array created");
        Ok(())
    }

    /// Serializes and stores the schema under its array URI, replacing
    /// any existing schema file.
    pub fn store_array_schema(
        &self,
        schema: &ArraySchema,
        encryption_key: &EncryptionKey,
    ) -> Result<()> {
        let filename = if schema.is_kv() {
            KV_SCHEMA_FILENAME
        } else {
            ARRAY_SCHEMA_FILENAME
        };
        let schema_uri = schema.array_uri().join_path(filename);
        write_generic_blob(&self.vfs, &schema_uri, &schema.serialize(), encryption_key)
    }

    /// Loads and deserializes the schema of the array at `array_uri`.
    pub fn load_array_schema(
        &self,
        array_uri: &Uri,
        object_type: ObjectType,
        encryption_key: &EncryptionKey,
    ) -> Result<ArraySchema> {
        if array_uri.is_invalid() {
            return Err(StorageError::InvalidUri(array_uri.to_string()).into());
        }
        let schema_uri = schema_uri_for(array_uri, object_type)?;

        let body = read_generic_blob(&self.vfs, &schema_uri, encryption_key)
            .wrap_err(StorageError::SchemaLoad(array_uri.to_string()))?;
        let mut schema = ArraySchema::deserialize(&body, object_type == ObjectType::KeyValue)
            .wrap_err(StorageError::SchemaLoad(array_uri.to_string()))?;
        schema.set_array_uri(array_uri.clone());
        Ok(schema)
    }

    /// Reads the encryption type recorded in the schema blob header,
    /// without needing a key.
    pub fn array_get_encryption(
        &self,
        array_uri: &Uri,
        object_type: ObjectType,
    ) -> Result<EncryptionType> {
        if array_uri.is_invalid() {
            return Err(StorageError::InvalidUri(array_uri.to_string()).into());
        }
        let schema_uri = schema_uri_for(array_uri, object_type)?;
        let header = read_generic_blob_header(&self.vfs, &schema_uri)?;
        Ok(header.encryption_type)
    }

    fn load_schema_into(
        &self,
        open_array: &OpenArray,
        object_type: ObjectType,
        encryption_key: &EncryptionKey,
    ) -> Result<()> {
        if open_array.array_schema().is_some() {
            return Ok(());
        }
        let schema = self.load_array_schema(open_array.array_uri(), object_type, encryption_key)?;
        open_array.set_array_schema(Arc::new(schema));
        Ok(())
    }

    fn validate_open_target(&self, array_uri: &Uri) -> Result<ObjectType> {
        if array_uri.is_invalid() || !self.vfs.supports_uri_scheme(array_uri) {
            return Err(StorageError::InvalidUri(array_uri.to_string()).into());
        }
        let object_type = self.object_type(array_uri)?;
        if !matches!(object_type, ObjectType::Array | ObjectType::KeyValue) {
            return Err(StorageError::NotFound(array_uri.to_string()))
                .wrap_err("cannot open array");
        }
        Ok(object_type)
    }

    /* ---------------- registry introspection ---------------- */

    /// The interned reads entry for `array_uri`, if any.
    pub fn open_array_for_reads(&self, array_uri: &Uri) -> Option<Arc<OpenArray>> {
        self.open_arrays_for_reads
            .lock()
            .get(array_uri.as_str())
            .cloned()
    }

    /// The interned writes entry for `array_uri`, if any.
    pub fn open_array_for_writes(&self, array_uri: &Uri) -> Option<Arc<OpenArray>> {
        self.open_arrays_for_writes
            .lock()
            .get(array_uri.as_str())
            .cloned()
    }

    pub fn open_arrays_for_reads_count(&self) -> usize {
        self.open_arrays_for_reads.lock().len()
    }

    pub fn open_arrays_for_writes_count(&self) -> usize {
        self.open_arrays_for_writes.lock().len()
    }
}

fn schema_uri_for(array_uri: &Uri, object_type: ObjectType) -> Result<Uri> {
    match object_type {
        ObjectType::Array => Ok(array_uri.join_path(ARRAY_SCHEMA_FILENAME)),
        ObjectType::KeyValue => Ok(array_uri.join_path(KV_SCHEMA_FILENAME)),
        _ => Err(StorageError::Internal(format!(
            "'{array_uri}' is not an array"
        ))
        .into()),
    }
}
