//! # Storage Manager
//!
//! The long-lived coordinator each client context owns. It sits between
//! query objects and the VFS and makes opening, reading, writing,
//! consolidating, and locking arrays safe under concurrent access from
//! multiple threads in this process and multiple processes on a shared
//! filesystem, while caching expensive-to-reload metadata across
//! queries.
//!
//! ## Structure
//!
//! ```text
//! StorageManager
//! ├── open_arrays_for_reads   Mutex<HashMap<String, Arc<OpenArray>>>
//! ├── open_arrays_for_writes  Mutex<HashMap<String, Arc<OpenArray>>>
//! ├── xlock_gate + xlock_cv   intra-process exclusion & reader drain
//! ├── xfilelocks              held exclusive filelocks, keyed by array
//! ├── tile_cache              LRU over decoded tiles
//! ├── async/reader/writer     worker pools sized from config
//! └── cancellation            cancel flag + in-progress counter (Arc)
//! ```
//!
//! ## Module Map
//!
//! - `open`: open/close/reopen for reads and writes, schema store/load,
//!   array creation
//! - `locks`: the exclusive-lock protocol
//! - `fragments`: fragment selection, parallel metadata loading,
//!   fragment info, domain and size estimates
//! - `objects`: object typing, iteration, remove/move, groups
//! - `consolidate`: metadata-level fragment consolidation under xlock
//! - `cancel`: cancellation state and the in-progress bracket
//!
//! ## Lock Order
//!
//! Exclusive gate → registry mutex → per-entry mutex → filelock.
//! Registry mutexes guard only their maps and are never held across
//! blocking I/O.

pub(crate) mod cancel;
mod consolidate;
mod fragments;
mod locks;
mod objects;
mod open;

use std::fs::File;
use std::sync::Arc;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

use crate::array::OpenArray;
use crate::cache::TileCache;
use crate::config::{
    StorageConfig, ARRAY_SCHEMA_FILENAME, FILELOCK_NAME, FRAGMENT_METADATA_FILENAME,
    KV_SCHEMA_FILENAME,
};
use crate::error::StorageError;
use crate::global;
use crate::pool::{CancelableTasks, ThreadPool};
use crate::query::Query;
use crate::uri::Uri;
use crate::vfs::Vfs;

use cancel::{Cancellation, QueryInProgress};
use locks::ExclusiveGate;

pub struct StorageManager {
    id: u64,
    config: StorageConfig,
    vfs: Arc<Vfs>,
    tile_cache: TileCache,
    async_pool: ThreadPool,
    reader_pool: ThreadPool,
    writer_pool: ThreadPool,
    tasks: CancelableTasks,
    cancellation: Arc<Cancellation>,
    open_arrays_for_reads: Mutex<HashMap<String, Arc<OpenArray>>>,
    open_arrays_for_writes: Mutex<HashMap<String, Arc<OpenArray>>>,
    xlock_gate: ExclusiveGate,
    xlock_cv: Condvar,
    xfilelocks: Mutex<HashMap<String, File>>,
    object_create_mtx: Mutex<()>,
}

impl StorageManager {
    pub fn new(config: StorageConfig) -> Result<Self> {
        let vfs = Arc::new(Vfs::new(config.vfs.clone()));
        let tasks = CancelableTasks::new();
        let cancellation = Arc::new(Cancellation::new(tasks.clone(), Arc::clone(&vfs)));

        let id = global::next_manager_id();
        global::register(id, Arc::downgrade(&cancellation));

        Ok(Self {
            id,
            tile_cache: TileCache::new(config.tile_cache_size),
            async_pool: ThreadPool::new(config.num_async_threads),
            reader_pool: ThreadPool::new(config.num_reader_threads),
            writer_pool: ThreadPool::new(config.num_writer_threads),
            vfs,
            tasks,
            cancellation,
            config,
            open_arrays_for_reads: Mutex::new(HashMap::new()),
            open_arrays_for_writes: Mutex::new(HashMap::new()),
            xlock_gate: ExclusiveGate::new(),
            xlock_cv: Condvar::new(),
            xfilelocks: Mutex::new(HashMap::new()),
            object_create_mtx: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn vfs(&self) -> &Arc<Vfs> {
        &self.vfs
    }

    pub fn tile_cache(&self) -> &TileCache {
        &self.tile_cache
    }

    pub fn reader_pool(&self) -> &ThreadPool {
        &self.reader_pool
    }

    pub fn writer_pool(&self) -> &ThreadPool {
        &self.writer_pool
    }

    /* ---------------- query gateway ---------------- */

    /// Runs a query on the caller's thread, bracketed by the in-progress
    /// counter. Refused with `Cancelled` while a cancellation sweep is
    /// draining.
    pub fn query_submit(&self, query: &dyn Query) -> Result<()> {
        process_query(&self.cancellation, query)
    }

    /// Queues a query on the async pool. If `cancel_all_tasks` sweeps
    /// the queue before the task starts, the query's `cancel` hook runs
    /// instead and `process` never does.
    pub fn query_submit_async(&self, query: Arc<dyn Query>) -> Result<()> {
        let cancellation = Arc::clone(&self.cancellation);
        let run_query = Arc::clone(&query);
        self.tasks.enqueue(
            &self.async_pool,
            move || {
                if let Err(e) = process_query(&cancellation, run_query.as_ref()) {
                    tracing::error!(error = %e, "async query failed");
                }
            },
            move || query.cancel(),
        );
        Ok(())
    }

    /* ---------------- cancellation ---------------- */

    /// Cancels queued async tasks and outstanding VFS I/O, then waits
    /// until every in-progress query has drained. Idempotent and safe
    /// to call from any thread.
    pub fn cancel_all_tasks(&self) -> Result<()> {
        self.cancellation.cancel_all_tasks()
    }

    /// Cooperative cancellation checkpoint for running queries.
    pub fn cancellation_in_progress(&self) -> bool {
        self.cancellation.in_progress()
    }

    /// Number of queries currently bracketed by the in-progress counter.
    pub fn queries_in_progress(&self) -> u64 {
        self.cancellation.queries_in_progress()
    }

    /* ---------------- tile cache facade ---------------- */

    /// Looks up `nbytes` of the object cached for `(uri, offset)`.
    pub fn read_from_cache(&self, uri: &Uri, offset: u64, nbytes: u64) -> Option<Vec<u8>> {
        let key = cache_key(uri, offset);
        self.tile_cache.read(&key, 0, nbytes)
    }

    /// Caches a copy of `bytes` under `(uri, offset)`. Oversized objects
    /// and metadata files (which the open-array entries already cache)
    /// are skipped.
    pub fn write_to_cache(&self, uri: &Uri, offset: u64, bytes: &[u8]) {
        if bytes.len() as u64 > self.tile_cache.max_size() {
            return;
        }
        let filename = uri.last_path_part();
        if filename == FRAGMENT_METADATA_FILENAME
            || filename == ARRAY_SCHEMA_FILENAME
            || filename == KV_SCHEMA_FILENAME
        {
            return;
        }
        self.tile_cache.insert(&cache_key(uri, offset), bytes.to_vec());
    }

    /* ---------------- VFS passthroughs ---------------- */

    pub fn create_dir(&self, uri: &Uri) -> Result<()> {
        self.vfs.create_dir(uri)
    }

    pub fn touch(&self, uri: &Uri) -> Result<()> {
        self.vfs.touch(uri)
    }

    pub fn is_dir(&self, uri: &Uri) -> Result<bool> {
        self.vfs.is_dir(uri)
    }

    pub fn is_file(&self, uri: &Uri) -> Result<bool> {
        self.vfs.is_file(uri)
    }

    pub fn read(&self, uri: &Uri, offset: u64, nbytes: u64) -> Result<Vec<u8>> {
        self.vfs.read(uri, offset, nbytes)
    }

    pub fn write(&self, uri: &Uri, data: &[u8]) -> Result<()> {
        self.vfs.write(uri, data)
    }

    pub fn sync(&self, uri: &Uri) -> Result<()> {
        self.vfs.sync(uri)
    }

    pub fn close_file(&self, uri: &Uri) -> Result<()> {
        self.vfs.close_file(uri)
    }
}

impl Drop for StorageManager {
    /// Teardown: unregister, cancel outstanding work, release every
    /// held filelock, drop all open-array entries, terminate the VFS.
    /// Failures are logged, never raised.
    fn drop(&mut self) {
        global::unregister(self.id);

        if let Err(e) = self.cancellation.cancel_all_tasks() {
            tracing::warn!(error = %e, "cancellation during teardown failed");
        }

        let xlocks: Vec<(String, File)> = self.xfilelocks.lock().drain().collect();
        for (array_uri, handle) in xlocks {
            let lock_uri = Uri::new(array_uri).join_path(FILELOCK_NAME);
            if let Err(e) = self.vfs.filelock_unlock(&lock_uri, &handle) {
                tracing::warn!(error = %e, lock = %lock_uri, "exclusive unlock during teardown failed");
            }
        }

        let reads: Vec<Arc<OpenArray>> = self
            .open_arrays_for_reads
            .lock()
            .drain()
            .map(|(_, oa)| oa)
            .collect();
        for open_array in reads {
            if let Err(e) = open_array.file_unlock(&self.vfs) {
                tracing::warn!(error = %e, array = %open_array.array_uri(), "shared unlock during teardown failed");
            }
        }
        self.open_arrays_for_writes.lock().clear();

        if let Err(e) = self.vfs.terminate() {
            tracing::warn!(error = %e, "VFS termination failed");
        }
    }
}

fn process_query(cancellation: &Cancellation, query: &dyn Query) -> Result<()> {
    let _in_progress = QueryInProgress::new(cancellation);
    if cancellation.in_progress() {
        return Err(StorageError::Cancelled.into());
    }
    query.process()
}

fn cache_key(uri: &Uri, offset: u64) -> String {
    format!("{uri}+{offset}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn cache_facade_skips_metadata_files() {
        let sm = StorageManager::new(StorageConfig::default()).unwrap();
        let frag = Uri::new("file:///a/__f_1");

        sm.write_to_cache(&frag.join_path(FRAGMENT_METADATA_FILENAME), 0, b"x");
        sm.write_to_cache(&frag.join_path(ARRAY_SCHEMA_FILENAME), 0, b"x");
        sm.write_to_cache(&frag.join_path(KV_SCHEMA_FILENAME), 0, b"x");
        assert_eq!(sm.tile_cache().len(), 0);

        sm.write_to_cache(&frag.join_path("tile_0"), 64, b"payload");
        assert_eq!(sm.tile_cache().len(), 1);
        assert_eq!(
            sm.read_from_cache(&frag.join_path("tile_0"), 64, 7).unwrap(),
            b"payload"
        );
        assert!(sm.read_from_cache(&frag.join_path("tile_0"), 0, 7).is_none());
    }

    #[test]
    fn cache_facade_skips_oversized_objects() {
        let mut config = StorageConfig::default();
        config.set("sm.tile_cache_size", "8").unwrap();
        let sm = StorageManager::new(config).unwrap();

        sm.write_to_cache(&Uri::new("file:///a/t"), 0, &[0u8; 16]);
        assert_eq!(sm.tile_cache().len(), 0);
    }

    #[test]
    fn vfs_passthroughs_reach_disk() {
        let dir = tempdir().unwrap();
        let sm = StorageManager::new(StorageConfig::default()).unwrap();
        let uri = Uri::new(format!("{}/f", dir.path().display()));

        sm.write(&uri, b"abcdef").unwrap();
        assert!(sm.is_file(&uri).unwrap());
        assert_eq!(sm.read(&uri, 2, 3).unwrap(), b"cde");
    }
}
