//! # Configuration Constants
//!
//! Centralized defaults and on-disk names. Constants that other modules
//! depend on live here rather than being scattered, so interdependent
//! values stay in one place.
//!
//! ## On-Disk Names
//!
//! These names are part of the storage format and must never change:
//!
//! ```text
//! <array>/__array_schema.tdb        array schema (dense/sparse)
//! <array>/__kv_schema.tdb           array schema (key-value)
//! <array>/__lockfile                filelock target
//! <array>/__<name>_<timestamp>/     fragment directory
//! <frag>/__fragment_metadata.tdb    fragment sentinel + metadata
//! <frag>/__coords.tdb               sparse-fragment sentinel
//! <group>/__tiledb_group.tdb        group marker
//! ```
//!
//! ## Pool Sizing
//!
//! Three worker pools are sized from config: async query submission,
//! fragment-metadata reads, and schema/metadata writes. Defaults of 1
//! keep a freshly constructed manager cheap; callers tune via
//! `sm.num_*_threads`.

/// Array schema filename for dense and sparse arrays.
pub const ARRAY_SCHEMA_FILENAME: &str = "__array_schema.tdb";

/// Array schema filename for key-value arrays.
pub const KV_SCHEMA_FILENAME: &str = "__kv_schema.tdb";

/// Filelock target inside every array directory.
pub const FILELOCK_NAME: &str = "__lockfile";

/// Fragment metadata filename; its presence marks a directory as a fragment.
pub const FRAGMENT_METADATA_FILENAME: &str = "__fragment_metadata.tdb";

/// Coordinate tile filename; its presence marks a fragment as sparse.
pub const COORDS_FILENAME: &str = "__coords.tdb";

/// Group marker filename.
pub const GROUP_FILENAME: &str = "__tiledb_group.tdb";

pub const DEFAULT_NUM_ASYNC_THREADS: usize = 1;
pub const DEFAULT_NUM_READER_THREADS: usize = 1;
pub const DEFAULT_NUM_WRITER_THREADS: usize = 1;

/// Tile cache capacity in bytes.
pub const DEFAULT_TILE_CACHE_SIZE: u64 = 10_000_000;

/// Current version stamped into schema and fragment-metadata files.
pub const STORAGE_FORMAT_VERSION: u32 = 1;
