//! # Fragment Selection and Loading
//!
//! The read side of fragment visibility: enumerate the array directory,
//! keep real fragments, parse timestamps out of directory names, filter
//! by the snapshot, sort deterministically, and load metadata in
//! parallel with memoization on the open-array entry.
//!
//! ## Determinism
//!
//! For a fixed snapshot, repeated opens return byte-identical fragment
//! lists in identical order: the sort key is `(timestamp, uri string)`
//! and `ls` output never leaks through.
//!
//! ## Timestamp Grammar
//!
//! A fragment basename starts with `__` and ends with
//! `_<decimal u64>`. A directory that carries the metadata sentinel but
//! not a parseable suffix is corrupt and fails hard with `Internal` —
//! silently skipping it would change visibility.

use std::collections::HashMap;
use std::sync::Arc;

use eyre::Result;
use parking_lot::Mutex;

use super::StorageManager;
use crate::array::{
    ArraySchema, EncryptionKey, FragmentInfo, FragmentMetadata, OpenArray, CELL_VAR_OFFSET_SIZE,
};
use crate::config::COORDS_FILENAME;
use crate::error::StorageError;
use crate::uri::Uri;

/// Parses the trailing `_<decimal u64>` of a fragment directory name.
pub(crate) fn fragment_timestamp(fragment_uri: &Uri) -> Result<u64> {
    let name = fragment_uri.last_path_part();
    if !name.starts_with("__") {
        return Err(StorageError::Internal(format!(
            "'{name}' is not a fragment directory name"
        ))
        .into());
    }
    let suffix = match name.rsplit_once('_') {
        Some((_, suffix)) => suffix,
        None => {
            return Err(StorageError::Internal(format!(
                "fragment name '{name}' has no timestamp suffix"
            ))
            .into());
        }
    };
    suffix.parse::<u64>().map_err(|_| {
        StorageError::Internal(format!(
            "fragment name '{name}' has unparseable timestamp '{suffix}'"
        ))
        .into()
    })
}

impl StorageManager {
    /// All fragment directories directly under `array_uri`: hidden
    /// entries are skipped, everything else is probed for the metadata
    /// sentinel.
    pub(crate) fn fragment_uris(&self, array_uri: &Uri) -> Result<Vec<Uri>> {
        let children = self.vfs.ls(&array_uri.add_trailing_slash())?;

        let mut fragment_uris = Vec::new();
        for child in children {
            if child.last_path_part().starts_with('.') {
                continue;
            }
            if self.is_fragment(&child)? {
                fragment_uris.push(child);
            }
        }
        Ok(fragment_uris)
    }

    /// Filters by `timestamp` and sorts ascending by
    /// `(timestamp, uri string)`.
    pub(crate) fn sorted_fragment_uris(
        &self,
        fragment_uris: &[Uri],
        timestamp: u64,
    ) -> Result<Vec<(u64, Uri)>> {
        let mut sorted = Vec::with_capacity(fragment_uris.len());
        for uri in fragment_uris {
            let t = fragment_timestamp(uri)?;
            if t <= timestamp {
                sorted.push((t, uri.clone()));
            }
        }
        sorted.sort();
        Ok(sorted)
    }

    /// Loads metadata for each `(timestamp, uri)` pair, reusing entries
    /// already memoized on `open_array` and loading the rest in parallel
    /// on the reader pool. The caller holds the entry mutex; the memo
    /// map's own lock admits the concurrent insertions. On failure the
    /// first error is returned and successfully loaded entries stay
    /// memoized, so a retry does not repeat their I/O.
    pub(crate) fn load_fragment_metadata(
        &self,
        open_array: &OpenArray,
        encryption_key: &EncryptionKey,
        fragments_to_load: &[(u64, Uri)],
    ) -> Result<Vec<Arc<FragmentMetadata>>> {
        let n = fragments_to_load.len();
        let slots: Mutex<Vec<Option<Arc<FragmentMetadata>>>> = Mutex::new(vec![None; n]);

        let statuses = self.reader_pool.parallel_for(0, n, |f| {
            let (timestamp, fragment_uri) = &fragments_to_load[f];
            let metadata = match open_array.fragment_metadata(fragment_uri) {
                Some(metadata) => metadata,
                None => {
                    let sparse = self
                        .vfs
                        .is_file(&fragment_uri.join_path(COORDS_FILENAME))?;
                    let metadata = Arc::new(FragmentMetadata::load(
                        &self.vfs,
                        encryption_key,
                        fragment_uri,
                        !sparse,
                        *timestamp,
                    )?);
                    open_array.insert_fragment_metadata(Arc::clone(&metadata));
                    metadata
                }
            };
            slots.lock()[f] = Some(metadata);
            Ok(())
        });
        for status in statuses {
            status?;
        }

        slots
            .into_inner()
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| {
                    StorageError::Internal("fragment load left an empty slot".into()).into()
                })
            })
            .collect()
    }

    /* ---------------- fragment info ---------------- */

    /// Loads boundary-visible info for every fragment visible at
    /// `timestamp`, in visibility order. Metadata is loaded standalone
    /// (not memoized on any open entry), in parallel.
    pub fn get_fragment_info(
        &self,
        schema: &ArraySchema,
        timestamp: u64,
        encryption_key: &EncryptionKey,
    ) -> Result<Vec<FragmentInfo>> {
        let fragment_uris = self.fragment_uris(schema.array_uri())?;
        if fragment_uris.is_empty() {
            return Ok(Vec::new());
        }
        let sorted = self.sorted_fragment_uris(&fragment_uris, timestamp)?;

        let n = sorted.len();
        let slots: Mutex<Vec<Option<FragmentInfo>>> = Mutex::new(vec![None; n]);
        let statuses = self.reader_pool.parallel_for(0, n, |f| {
            let (t, fragment_uri) = &sorted[f];
            let info = self.load_fragment_info(encryption_key, fragment_uri, *t)?;
            slots.lock()[f] = Some(info);
            Ok(())
        });
        for status in statuses {
            status?;
        }

        slots
            .into_inner()
            .into_iter()
            .map(|slot| {
                slot.ok_or_else(|| {
                    StorageError::Internal("fragment info left an empty slot".into()).into()
                })
            })
            .collect()
    }

    /// Info for a single fragment directory; the timestamp comes from
    /// the directory name.
    pub fn get_fragment_info_single(
        &self,
        encryption_key: &EncryptionKey,
        fragment_uri: &Uri,
    ) -> Result<FragmentInfo> {
        let timestamp = fragment_timestamp(fragment_uri)?;
        self.load_fragment_info(encryption_key, fragment_uri, timestamp)
    }

    fn load_fragment_info(
        &self,
        encryption_key: &EncryptionKey,
        fragment_uri: &Uri,
        timestamp: u64,
    ) -> Result<FragmentInfo> {
        let sparse = self
            .vfs
            .is_file(&fragment_uri.join_path(COORDS_FILENAME))?;
        let metadata =
            FragmentMetadata::load(&self.vfs, encryption_key, fragment_uri, !sparse, timestamp)?;
        Ok(metadata.to_fragment_info())
    }

    /* ---------------- domain & size estimates ---------------- */

    /// Union of the non-empty domains of the given fragments, which
    /// must belong to an array currently open for reads. `None` when
    /// the array has no fragments.
    pub fn array_non_empty_domain(
        &self,
        array_uri: &Uri,
        schema: &ArraySchema,
        metadata: &[Arc<FragmentMetadata>],
    ) -> Result<Option<Vec<u8>>> {
        if self.open_array_for_reads(array_uri).is_none() {
            return Err(StorageError::Internal(format!(
                "cannot get non-empty domain: '{array_uri}' not open for reads"
            ))
            .into());
        }
        let Some(first) = metadata.first() else {
            return Ok(None);
        };

        let mut domain = first.non_empty_domain().to_vec();
        for m in &metadata[1..] {
            schema.domain().expand_range(&mut domain, m.non_empty_domain())?;
        }
        Ok(Some(domain))
    }

    /// Per-attribute `(fixed, var)` read-buffer upper bounds for
    /// `subarray` over the given fragments. Dense arrays are rectified
    /// to the exact subarray cell count; sparse arrays with integer
    /// domains are clamped by it. A zero cell count (overflow) leaves
    /// the rough bound in place.
    pub fn array_compute_est_read_buffer_sizes(
        &self,
        schema: &ArraySchema,
        metadata: &[Arc<FragmentMetadata>],
        subarray: &[u8],
    ) -> Result<HashMap<String, (f64, f64)>> {
        let mut sizes = HashMap::new();
        if metadata.is_empty() {
            return Ok(sizes);
        }

        for m in metadata {
            m.add_est_read_buffer_sizes(schema, subarray, &mut sizes)?;
        }

        let cell_num = schema.domain().cell_num(subarray)?;
        if cell_num == 0 {
            return Ok(sizes);
        }

        if schema.dense() {
            for (name, entry) in sizes.iter_mut() {
                entry.0 = if schema.var_size(name) {
                    (cell_num * CELL_VAR_OFFSET_SIZE) as f64
                } else if let Some(cell_size) = schema.cell_size(name) {
                    (cell_num * cell_size) as f64
                } else {
                    entry.0
                };
            }
        } else if schema.coords_type().is_integer() {
            for (name, entry) in sizes.iter_mut() {
                if schema.var_size(name) {
                    continue;
                }
                let Some(cell_size) = schema.cell_size(name) else {
                    continue;
                };
                if let Some(bound) = cell_num.checked_mul(cell_size) {
                    entry.0 = entry.0.min(bound as f64);
                }
            }
        }

        Ok(sizes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_parsing() {
        assert_eq!(
            fragment_timestamp(&Uri::new("/a/__f1_100")).unwrap(),
            100
        );
        assert_eq!(
            fragment_timestamp(&Uri::new("/a/__x_y_18446744073709551615/")).unwrap(),
            u64::MAX
        );
    }

    #[test]
    fn malformed_names_fail_hard() {
        for name in ["/a/__nounderscoretail", "/a/__f_12x", "/a/f_12"] {
            let err = fragment_timestamp(&Uri::new(name)).unwrap_err();
            assert!(matches!(
                crate::error::storage_error(&err),
                Some(StorageError::Internal(_))
            ));
        }
    }
}
