//! # Storage Manager Configuration
//!
//! [`StorageConfig`] carries the knobs the coordinator reads at init:
//! worker pool sizes and the tile cache capacity. Unrecognized `sm.*`
//! keys are rejected; `vfs.*` keys are forwarded verbatim to the VFS
//! layer, which interprets the ones it knows and preserves the rest.
//!
//! | Key                     | Default    | Meaning                     |
//! |-------------------------|------------|-----------------------------|
//! | `sm.num_async_threads`  | 1          | async query pool size       |
//! | `sm.num_reader_threads` | 1          | fragment-metadata pool size |
//! | `sm.num_writer_threads` | 1          | writer pool size            |
//! | `sm.tile_cache_size`    | 10,000,000 | LRU capacity in bytes       |
//! | `vfs.*`                 | —          | forwarded to the VFS        |

pub mod constants;
pub use constants::*;

use std::collections::HashMap;

use eyre::{bail, Result, WrapErr};

#[derive(Debug, Clone, Default)]
pub struct VfsConfig {
    options: HashMap<String, String>,
}

impl VfsConfig {
    /// Stores a `vfs.*` option, keyed without the `vfs.` prefix.
    pub fn set(&mut self, key: &str, value: &str) {
        self.options.insert(key.to_string(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.options.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub num_async_threads: usize,
    pub num_reader_threads: usize,
    pub num_writer_threads: usize,
    pub tile_cache_size: u64,
    pub vfs: VfsConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            num_async_threads: DEFAULT_NUM_ASYNC_THREADS,
            num_reader_threads: DEFAULT_NUM_READER_THREADS,
            num_writer_threads: DEFAULT_NUM_WRITER_THREADS,
            tile_cache_size: DEFAULT_TILE_CACHE_SIZE,
            vfs: VfsConfig::default(),
        }
    }
}

impl StorageConfig {
    /// String-keyed setter mirroring the client-facing config surface.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        if let Some(vfs_key) = key.strip_prefix("vfs.") {
            self.vfs.set(vfs_key, value);
            return Ok(());
        }

        match key {
            "sm.num_async_threads" => {
                self.num_async_threads = parse_pool_size(key, value)?;
            }
            "sm.num_reader_threads" => {
                self.num_reader_threads = parse_pool_size(key, value)?;
            }
            "sm.num_writer_threads" => {
                self.num_writer_threads = parse_pool_size(key, value)?;
            }
            "sm.tile_cache_size" => {
                self.tile_cache_size = value
                    .parse::<u64>()
                    .wrap_err_with(|| format!("invalid value '{value}' for '{key}'"))?;
            }
            _ => bail!("unrecognized config option '{key}'"),
        }

        Ok(())
    }
}

fn parse_pool_size(key: &str, value: &str) -> Result<usize> {
    let n = value
        .parse::<usize>()
        .wrap_err_with(|| format!("invalid value '{value}' for '{key}'"))?;
    if n == 0 {
        bail!("'{key}' must be at least 1");
    }
    Ok(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = StorageConfig::default();
        assert_eq!(config.num_async_threads, DEFAULT_NUM_ASYNC_THREADS);
        assert_eq!(config.tile_cache_size, DEFAULT_TILE_CACHE_SIZE);
    }

    #[test]
    fn set_sm_options() {
        let mut config = StorageConfig::default();
        config.set("sm.num_async_threads", "4").unwrap();
        config.set("sm.num_reader_threads", "8").unwrap();
        config.set("sm.tile_cache_size", "1024").unwrap();
        assert_eq!(config.num_async_threads, 4);
        assert_eq!(config.num_reader_threads, 8);
        assert_eq!(config.tile_cache_size, 1024);
    }

    #[test]
    fn vfs_options_forwarded_verbatim() {
        let mut config = StorageConfig::default();
        config.set("vfs.min_parallel_size", "65536").unwrap();
        config.set("vfs.s3.region", "us-east-1").unwrap();
        assert_eq!(config.vfs.get("min_parallel_size"), Some("65536"));
        assert_eq!(config.vfs.get("s3.region"), Some("us-east-1"));
    }

    #[test]
    fn rejects_unknown_and_malformed() {
        let mut config = StorageConfig::default();
        assert!(config.set("sm.bogus", "1").is_err());
        assert!(config.set("sm.num_reader_threads", "zero").is_err());
        assert!(config.set("sm.num_reader_threads", "0").is_err());
    }
}
