//! # Tessera - Tiled Multi-Dimensional Array Storage
//!
//! Tessera is the storage-manager core of a multi-dimensional array
//! database: the concurrency and lifecycle coordinator between client
//! query objects and the filesystem. It makes opening, reading,
//! writing, consolidating, and locking arrays safe under concurrent
//! access from multiple threads within a process and multiple processes
//! on a shared filesystem, while caching expensive-to-reload metadata
//! (array schemas, fragment metadata) across queries.
//!
//! ## Quick Start
//!
//! ```ignore
//! use tessera::{ArraySchema, EncryptionKey, StorageConfig, StorageManager, Uri};
//!
//! let sm = StorageManager::new(StorageConfig::default())?;
//! let uri = Uri::new("file:///data/temperature");
//! let key = EncryptionKey::no_encryption();
//!
//! sm.array_create(&uri, &schema, &key)?;
//!
//! // Open at a snapshot; every fragment committed at or before it is
//! // visible, in deterministic order.
//! let (schema, fragments) = sm.array_open_for_reads(&uri, u64::MAX, &key)?;
//! // ... run queries against the borrowed metadata ...
//! sm.array_close_for_reads(&uri)?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │        StorageManager (coordinator)       │
//! ├──────────────┬──────────────┬────────────┤
//! │  Open-array  │    Lock      │  Fragment  │
//! │  registries  │   manager    │  selector  │
//! ├──────────────┴──────┬───────┴────────────┤
//! │  Parallel metadata  │  Cancellation &    │
//! │  loader (pools)     │  quiescence        │
//! ├─────────────────────┴────────────────────┤
//! │        LRU tile cache │ object walks      │
//! ├──────────────────────────────────────────┤
//! │            VFS (posix + filelocks)        │
//! └──────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency Model
//!
//! Plain OS threads. Three worker pools (async query, reader, writer)
//! are sized from [`StorageConfig`]; synchronous calls run on the
//! caller's thread. Cross-process isolation uses advisory filelocks on
//! `<array>/__lockfile`: shared while readers hold an array open,
//! exclusive during consolidation. Intra-process, a strict lock order
//! (exclusive gate → registry → per-entry mutex → filelock) keeps the
//! layers deadlock-free.
//!
//! ## On-Disk Layout
//!
//! ```text
//! <array>/
//! ├── __array_schema.tdb        # schema (or __kv_schema.tdb)
//! ├── __lockfile                # filelock target
//! ├── __f1_100/                 # fragment, timestamp 100
//! │   ├── __fragment_metadata.tdb
//! │   └── __coords.tdb          # present iff sparse
//! └── __f2_200/
//! ```

pub mod array;
pub mod cache;
pub mod config;
pub mod error;
pub mod global;
pub mod manager;
pub mod object;
pub mod pool;
pub mod query;
pub mod uri;
pub mod vfs;

pub use array::{
    ArraySchema, ArrayType, Attribute, AttributeSizes, Datatype, Domain, EncryptionKey,
    EncryptionType, FragmentInfo, FragmentMetadata, OpenArray,
};
pub use cache::TileCache;
pub use config::{StorageConfig, VfsConfig};
pub use error::{storage_error, StorageError};
pub use global::cancel_all_managers;
pub use manager::StorageManager;
pub use object::{ObjectIter, ObjectType, WalkOrder};
pub use pool::ThreadPool;
pub use query::{Query, QueryType};
pub use uri::Uri;
pub use vfs::Vfs;
