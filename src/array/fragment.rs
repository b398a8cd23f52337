//! # Fragment Metadata
//!
//! A fragment is one timestamped, immutable contribution to an array: a
//! directory `__<name>_<timestamp>/` holding attribute tiles, a
//! `__coords.tdb` tile when sparse, and a `__fragment_metadata.tdb`
//! blob described here. The metadata is what reads consult before
//! touching any tile: the fragment's non-empty domain, its total size,
//! and per-attribute byte counts used for read-buffer estimates.
//!
//! ## Body Layout
//!
//! Wrapped in the generic blob envelope:
//!
//! ```text
//! dense u8 | timestamp u64
//! domain_len u32 | non_empty_domain bytes
//! fragment_size u64
//! attr_count u32
//! per attribute: name (u32 len + bytes) | fixed_bytes u64 | var_bytes u64
//! ```
//!
//! Loading cross-checks the stored `dense` flag and timestamp against
//! what the caller derived from the directory (coords probe, name
//! suffix); disagreement means the directory was tampered with and
//! fails the load.

use eyre::{Result, WrapErr};
use std::collections::HashMap;

use super::{put_str, put_u32, put_u64, read_generic_blob, write_generic_blob, Decoder};
use super::{ArraySchema, EncryptionKey};
use crate::config::FRAGMENT_METADATA_FILENAME;
use crate::error::StorageError;
use crate::uri::Uri;
use crate::vfs::Vfs;

/// Boundary-visible fragment record, as returned by
/// `get_fragment_info`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FragmentInfo {
    pub uri: Uri,
    pub sparse: bool,
    pub timestamp: u64,
    pub size_bytes: u64,
    pub non_empty_domain: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeSizes {
    pub name: String,
    pub fixed_bytes: u64,
    pub var_bytes: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FragmentMetadata {
    fragment_uri: Uri,
    dense: bool,
    timestamp: u64,
    non_empty_domain: Vec<u8>,
    fragment_size: u64,
    attr_sizes: Vec<AttributeSizes>,
}

impl FragmentMetadata {
    pub fn new(fragment_uri: Uri, dense: bool, timestamp: u64) -> Self {
        Self {
            fragment_uri,
            dense,
            timestamp,
            non_empty_domain: Vec::new(),
            fragment_size: 0,
            attr_sizes: Vec::new(),
        }
    }

    pub fn fragment_uri(&self) -> &Uri {
        &self.fragment_uri
    }

    pub fn dense(&self) -> bool {
        self.dense
    }

    pub fn sparse(&self) -> bool {
        !self.dense
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn non_empty_domain(&self) -> &[u8] {
        &self.non_empty_domain
    }

    pub fn fragment_size(&self) -> u64 {
        self.fragment_size
    }

    pub fn attr_sizes(&self) -> &[AttributeSizes] {
        &self.attr_sizes
    }

    pub fn set_non_empty_domain(&mut self, bytes: Vec<u8>) {
        self.non_empty_domain = bytes;
    }

    pub fn set_fragment_size(&mut self, size: u64) {
        self.fragment_size = size;
    }

    pub fn push_attr_size(&mut self, name: impl Into<String>, fixed_bytes: u64, var_bytes: u64) {
        self.attr_sizes.push(AttributeSizes {
            name: name.into(),
            fixed_bytes,
            var_bytes,
        });
    }

    fn metadata_uri(fragment_uri: &Uri) -> Uri {
        fragment_uri.join_path(FRAGMENT_METADATA_FILENAME)
    }

    /// Loads the metadata blob of `fragment_uri`. `dense` and
    /// `timestamp` are what the caller derived from the directory and
    /// must agree with the stored values.
    pub fn load(
        vfs: &Vfs,
        key: &EncryptionKey,
        fragment_uri: &Uri,
        dense: bool,
        timestamp: u64,
    ) -> Result<Self> {
        let meta_uri = Self::metadata_uri(fragment_uri);
        let body = read_generic_blob(vfs, &meta_uri, key)
            .wrap_err(StorageError::FragmentLoad(fragment_uri.to_string()))?;

        let decoded = (|| -> Result<_> {
            let mut dec = Decoder::new(&body);
            let stored_dense = dec.u8()? != 0;
            let stored_timestamp = dec.u64()?;
            let domain_len = dec.u32()? as usize;
            let non_empty_domain = dec.bytes(domain_len)?;
            let fragment_size = dec.u64()?;
            let attr_count = dec.u32()?;
            let mut attr_sizes = Vec::with_capacity(attr_count as usize);
            for _ in 0..attr_count {
                let name = dec.string()?;
                let fixed_bytes = dec.u64()?;
                let var_bytes = dec.u64()?;
                attr_sizes.push(AttributeSizes {
                    name,
                    fixed_bytes,
                    var_bytes,
                });
            }
            Ok((
                stored_dense,
                stored_timestamp,
                non_empty_domain,
                fragment_size,
                attr_sizes,
            ))
        })();
        let (stored_dense, stored_timestamp, non_empty_domain, fragment_size, attr_sizes) =
            decoded.wrap_err(StorageError::FragmentLoad(fragment_uri.to_string()))?;

        if stored_dense != dense || stored_timestamp != timestamp {
            return Err(StorageError::FragmentLoad(fragment_uri.to_string()))
                .wrap_err("stored dense flag or timestamp disagrees with the directory");
        }

        Ok(Self {
            fragment_uri: fragment_uri.clone(),
            dense,
            timestamp,
            non_empty_domain,
            fragment_size,
            attr_sizes,
        })
    }

    /// Writes the metadata blob into the fragment directory, replacing
    /// any previous one.
    pub fn store(&self, vfs: &Vfs, key: &EncryptionKey) -> Result<()> {
        let mut body = Vec::new();
        body.push(self.dense as u8);
        put_u64(&mut body, self.timestamp);
        put_u32(&mut body, self.non_empty_domain.len() as u32);
        body.extend_from_slice(&self.non_empty_domain);
        put_u64(&mut body, self.fragment_size);
        put_u32(&mut body, self.attr_sizes.len() as u32);
        for attr in &self.attr_sizes {
            put_str(&mut body, &attr.name);
            put_u64(&mut body, attr.fixed_bytes);
            put_u64(&mut body, attr.var_bytes);
        }

        write_generic_blob(vfs, &Self::metadata_uri(&self.fragment_uri), &body, key)
    }

    /// Accumulates this fragment's contribution to per-attribute
    /// `(fixed, var)` read-buffer upper bounds for `subarray`.
    pub fn add_est_read_buffer_sizes(
        &self,
        schema: &ArraySchema,
        subarray: &[u8],
        sizes: &mut HashMap<String, (f64, f64)>,
    ) -> Result<()> {
        if self.non_empty_domain.is_empty() {
            return Ok(());
        }
        let frac = schema
            .domain()
            .overlap_fraction(subarray, &self.non_empty_domain)?;
        for attr in &self.attr_sizes {
            let entry = sizes.entry(attr.name.clone()).or_insert((0.0, 0.0));
            entry.0 += frac * attr.fixed_bytes as f64;
            entry.1 += frac * attr.var_bytes as f64;
        }
        Ok(())
    }

    pub fn to_fragment_info(&self) -> FragmentInfo {
        FragmentInfo {
            uri: self.fragment_uri.clone(),
            sparse: self.sparse(),
            timestamp: self.timestamp,
            size_bytes: self.fragment_size,
            non_empty_domain: self.non_empty_domain.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::schema::{range_from_i64, ArrayType, Attribute, Datatype, Domain};
    use crate::config::VfsConfig;
    use tempfile::tempdir;

    fn fragment_fixture(dir: &std::path::Path) -> (Vfs, Uri, EncryptionKey) {
        let vfs = Vfs::new(VfsConfig::default());
        let frag = Uri::new(format!("{}/__f1_100", dir.display()));
        vfs.create_dir(&frag).unwrap();
        (vfs, frag, EncryptionKey::no_encryption())
    }

    #[test]
    fn store_load_roundtrip() {
        let dir = tempdir().unwrap();
        let (vfs, frag, key) = fragment_fixture(dir.path());

        let mut meta = FragmentMetadata::new(frag.clone(), true, 100);
        meta.set_non_empty_domain(range_from_i64(Datatype::Int64, &[(0, 9)]));
        meta.set_fragment_size(4096);
        meta.push_attr_size("a", 4000, 0);
        meta.store(&vfs, &key).unwrap();

        let loaded = FragmentMetadata::load(&vfs, &key, &frag, true, 100).unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(loaded.fragment_size(), 4096);
    }

    #[test]
    fn load_rejects_disagreeing_directory_facts() {
        let dir = tempdir().unwrap();
        let (vfs, frag, key) = fragment_fixture(dir.path());

        let meta = FragmentMetadata::new(frag.clone(), true, 100);
        meta.store(&vfs, &key).unwrap();

        let err = FragmentMetadata::load(&vfs, &key, &frag, false, 100).unwrap_err();
        assert!(matches!(
            crate::error::storage_error(&err),
            Some(StorageError::FragmentLoad(_))
        ));
        assert!(FragmentMetadata::load(&vfs, &key, &frag, true, 101).is_err());
    }

    #[test]
    fn missing_metadata_is_fragment_load_error() {
        let dir = tempdir().unwrap();
        let vfs = Vfs::new(VfsConfig::default());
        let frag = Uri::new(format!("{}/__nope_5", dir.path().display()));
        vfs.create_dir(&frag).unwrap();

        let err =
            FragmentMetadata::load(&vfs, &EncryptionKey::no_encryption(), &frag, true, 5)
                .unwrap_err();
        assert!(matches!(
            crate::error::storage_error(&err),
            Some(StorageError::FragmentLoad(_))
        ));
    }

    #[test]
    fn est_read_buffer_sizes_scale_with_overlap() {
        let dir = tempdir().unwrap();
        let (_vfs, frag, _key) = fragment_fixture(dir.path());

        let domain = Domain::new(
            Datatype::Int64,
            1,
            range_from_i64(Datatype::Int64, &[(0, 99)]),
        )
        .unwrap();
        let schema = ArraySchema::new(
            ArrayType::Dense,
            domain,
            vec![Attribute::fixed("a", Datatype::Int32)],
        );

        let mut meta = FragmentMetadata::new(frag, true, 1);
        meta.set_non_empty_domain(range_from_i64(Datatype::Int64, &[(0, 9)]));
        meta.push_attr_size("a", 1000, 0);

        let mut sizes = HashMap::new();
        let half = range_from_i64(Datatype::Int64, &[(5, 99)]);
        meta.add_est_read_buffer_sizes(&schema, &half, &mut sizes)
            .unwrap();
        assert_eq!(sizes["a"], (500.0, 0.0));
    }

    #[test]
    fn to_fragment_info_mirrors_fields() {
        let dir = tempdir().unwrap();
        let (_vfs, frag, _key) = fragment_fixture(dir.path());

        let mut meta = FragmentMetadata::new(frag.clone(), false, 7);
        meta.set_fragment_size(123);
        let info = meta.to_fragment_info();
        assert_eq!(info.uri, frag);
        assert!(info.sparse);
        assert_eq!(info.timestamp, 7);
        assert_eq!(info.size_bytes, 123);
    }
}
