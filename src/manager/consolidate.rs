//! # Fragment Consolidation
//!
//! Consolidation merges an array's fragments into one, reclaiming the
//! per-fragment open cost. It is the sole client of the exclusive-lock
//! protocol: the merged fragment is written and the sources removed
//! only once every reader has drained and the exclusive filelock is
//! held, so no reader in any process ever sees a half-consolidated
//! directory.
//!
//! ## Steps
//!
//! 1. Open the array for reads at `u64::MAX` — a snapshot of every
//!    committed fragment. Zero or one fragment means nothing to do.
//! 2. Merge while still open: union the non-empty domains, sum sizes,
//!    sum per-attribute byte counts. The merged fragment's timestamp is
//!    the newest source's, so visibility of consolidated data is
//!    unchanged for every snapshot at or after it.
//! 3. Close the read session (holding it would deadlock our own
//!    exclusive lock against the reader drain).
//! 4. `xlock`, write the merged fragment, remove the sources,
//!    `xunlock`.
//!
//! Tile-level data merging belongs to the query pipeline; what is
//! consolidated here is the fragment set and its metadata.

use std::sync::atomic::{AtomicU64, Ordering};

use eyre::Result;

use super::StorageManager;
use crate::array::{AttributeSizes, EncryptionKey, FragmentMetadata};
use crate::config::COORDS_FILENAME;
use crate::error::StorageError;
use crate::object::ObjectType;
use crate::uri::Uri;

static CONSOLIDATE_SEQ: AtomicU64 = AtomicU64::new(0);

impl StorageManager {
    /// Consolidates all committed fragments of the array at
    /// `array_name` into a single fragment.
    pub fn array_consolidate(&self, array_name: &str, encryption_key: &EncryptionKey) -> Result<()> {
        let array_uri = Uri::new(array_name);
        if array_uri.is_invalid() {
            return Err(StorageError::InvalidUri(array_name.to_string()).into());
        }
        let object_type = self.object_type(&array_uri)?;
        if !matches!(object_type, ObjectType::Array | ObjectType::KeyValue) {
            return Err(StorageError::NotFound(array_name.to_string()).into());
        }

        Consolidator::new(self).consolidate(&array_uri, encryption_key)
    }
}

pub(crate) struct Consolidator<'a> {
    sm: &'a StorageManager,
}

impl<'a> Consolidator<'a> {
    pub fn new(sm: &'a StorageManager) -> Self {
        Self { sm }
    }

    pub fn consolidate(&self, array_uri: &Uri, encryption_key: &EncryptionKey) -> Result<()> {
        let (schema, metadata) =
            self.sm
                .array_open_for_reads(array_uri, u64::MAX, encryption_key)?;

        if metadata.len() <= 1 {
            return self.sm.array_close_for_reads(array_uri);
        }

        // Merge under the open session; the Arcs stay valid after close.
        let merge = (|| -> Result<Merged> {
            let newest = &metadata[metadata.len() - 1];
            let mut domain: Vec<u8> = Vec::new();
            let mut attr_sizes: Vec<AttributeSizes> = Vec::new();
            let mut total_size = 0u64;
            let mut any_sparse = false;

            for m in metadata.iter() {
                if !m.non_empty_domain().is_empty() {
                    if domain.is_empty() {
                        domain = m.non_empty_domain().to_vec();
                    } else {
                        schema
                            .domain()
                            .expand_range(&mut domain, m.non_empty_domain())?;
                    }
                }
                total_size = total_size.saturating_add(m.fragment_size());
                any_sparse |= m.sparse();
                for attr in m.attr_sizes() {
                    match attr_sizes.iter_mut().find(|a| a.name == attr.name) {
                        Some(existing) => {
                            existing.fixed_bytes += attr.fixed_bytes;
                            existing.var_bytes += attr.var_bytes;
                        }
                        None => attr_sizes.push(attr.clone()),
                    }
                }
            }

            Ok(Merged {
                timestamp: newest.timestamp(),
                domain,
                attr_sizes,
                total_size,
                any_sparse,
                sources: metadata.iter().map(|m| m.fragment_uri().clone()).collect(),
            })
        })();

        // The read session must end before xlock, which waits for the
        // reads registry to drain.
        let closed = self.sm.array_close_for_reads(array_uri);
        let merged = merge?;
        closed?;

        self.sm.array_xlock(array_uri)?;
        let result = self.write_and_swap(array_uri, encryption_key, &merged);
        let unlocked = self.sm.array_xunlock(array_uri);
        result?;
        unlocked
    }

    fn write_and_swap(
        &self,
        array_uri: &Uri,
        encryption_key: &EncryptionKey,
        merged: &Merged,
    ) -> Result<()> {
        let fragment_uri = self.fresh_fragment_uri(array_uri, merged.timestamp)?;

        let written = (|| -> Result<()> {
            self.sm.vfs.create_dir(&fragment_uri)?;

            let mut meta =
                FragmentMetadata::new(fragment_uri.clone(), !merged.any_sparse, merged.timestamp);
            meta.set_non_empty_domain(merged.domain.clone());
            meta.set_fragment_size(merged.total_size);
            for attr in &merged.attr_sizes {
                meta.push_attr_size(&attr.name, attr.fixed_bytes, attr.var_bytes);
            }
            meta.store(&self.sm.vfs, encryption_key)?;

            if merged.any_sparse {
                self.sm.vfs.touch(&fragment_uri.join_path(COORDS_FILENAME))?;
            }
            Ok(())
        })();
        if let Err(e) = written {
            let _ = self.sm.vfs.remove_dir(&fragment_uri);
            return Err(e);
        }

        for source in &merged.sources {
            self.sm.vfs.remove_dir(source)?;
        }

        tracing::debug!(
            array = %array_uri,
            fragments = merged.sources.len(),
            "fragments consolidated"
        );
        Ok(())
    }

    /// A fragment directory name that does not collide with anything
    /// already in the array.
    fn fresh_fragment_uri(&self, array_uri: &Uri, timestamp: u64) -> Result<Uri> {
        loop {
            let seq = CONSOLIDATE_SEQ.fetch_add(1, Ordering::Relaxed);
            let candidate = array_uri.join_path(&format!("__c{seq}_{timestamp}"));
            if !self.sm.vfs.is_dir(&candidate)? {
                return Ok(candidate);
            }
        }
    }
}

struct Merged {
    timestamp: u64,
    domain: Vec<u8>,
    attr_sizes: Vec<AttributeSizes>,
    total_size: u64,
    any_sparse: bool,
    sources: Vec<Uri>,
}
