//! # Virtual File System
//!
//! Every byte the storage manager touches goes through this facade. The
//! [`Vfs`] dispatches on URI scheme; `file://` URIs and plain paths land
//! on the posix backend, anything else is rejected with `InvalidUri`
//! before a syscall is made.
//!
//! ## Operations
//!
//! Directory ops (`create_dir`, `ls`, `remove_dir`, `move_dir`), file ops
//! (`touch`, `read`, `write`, `sync`, `file_size`, `remove_file`,
//! `close_file`), probes (`is_dir`, `is_file`), and process filelocks
//! (`filelock_lock`, `filelock_unlock`).
//!
//! ## Filelocks
//!
//! Cross-process reader/writer isolation uses advisory locks on a
//! dedicated `__lockfile` inside each array directory, via `fs2`:
//! shared for readers, exclusive for consolidation. The returned handle
//! owns the lock; `filelock_unlock` releases it explicitly.
//!
//! ## Listing Order
//!
//! `ls` sorts children by URI string. Callers must not depend on any
//! filesystem enumeration order, and with this guarantee they never see
//! one.
//!
//! ## Thread Safety
//!
//! `Vfs` is `Send + Sync`; all operations take `&self` and hold no
//! internal locks across I/O. Synchronous posix I/O has no queued tasks,
//! so `cancel_all_tasks` has nothing to sweep; it exists for interface
//! parity with remote backends.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::{Result, WrapErr};
use fs2::FileExt;

use crate::config::VfsConfig;
use crate::error::StorageError;
use crate::uri::{Uri, FILE_SCHEME};

pub struct Vfs {
    #[allow(dead_code)]
    config: VfsConfig,
    terminated: AtomicBool,
}

impl Vfs {
    pub fn new(config: VfsConfig) -> Self {
        Self {
            config,
            terminated: AtomicBool::new(false),
        }
    }

    pub fn supports_uri_scheme(&self, uri: &Uri) -> bool {
        matches!(uri.scheme(), None | Some(FILE_SCHEME))
    }

    fn check_uri(&self, uri: &Uri) -> Result<()> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(StorageError::Internal("VFS already terminated".into()).into());
        }
        if uri.is_invalid() || !self.supports_uri_scheme(uri) {
            return Err(StorageError::InvalidUri(uri.to_string()).into());
        }
        Ok(())
    }

    pub fn create_dir(&self, uri: &Uri) -> Result<()> {
        self.check_uri(uri)?;
        std::fs::create_dir_all(uri.to_path())
            .wrap_err_with(|| format!("cannot create directory '{uri}'"))
    }

    pub fn is_dir(&self, uri: &Uri) -> Result<bool> {
        self.check_uri(uri)?;
        Ok(uri.to_path().is_dir())
    }

    pub fn is_file(&self, uri: &Uri) -> Result<bool> {
        self.check_uri(uri)?;
        Ok(uri.to_path().is_file())
    }

    /// Lists the children of a directory, sorted by URI string.
    pub fn ls(&self, uri: &Uri) -> Result<Vec<Uri>> {
        self.check_uri(uri)?;
        let entries = std::fs::read_dir(uri.to_path())
            .wrap_err_with(|| format!("cannot list directory '{uri}'"))?;

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.wrap_err_with(|| format!("cannot list directory '{uri}'"))?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            children.push(uri.join_path(&name));
        }
        children.sort();
        Ok(children)
    }

    pub fn touch(&self, uri: &Uri) -> Result<()> {
        self.check_uri(uri)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(uri.to_path())
            .wrap_err_with(|| format!("cannot touch '{uri}'"))?;
        Ok(())
    }

    /// Reads exactly `nbytes` starting at `offset`.
    pub fn read(&self, uri: &Uri, offset: u64, nbytes: u64) -> Result<Vec<u8>> {
        self.check_uri(uri)?;
        let mut file =
            File::open(uri.to_path()).wrap_err_with(|| format!("cannot open '{uri}'"))?;
        file.seek(SeekFrom::Start(offset))
            .wrap_err_with(|| format!("cannot seek '{uri}' to {offset}"))?;
        let mut buf = vec![0u8; nbytes as usize];
        file.read_exact(&mut buf)
            .wrap_err_with(|| format!("short read of {nbytes} bytes at {offset} from '{uri}'"))?;
        Ok(buf)
    }

    /// Reads the whole file.
    pub fn read_all(&self, uri: &Uri) -> Result<Vec<u8>> {
        self.check_uri(uri)?;
        std::fs::read(uri.to_path()).wrap_err_with(|| format!("cannot read '{uri}'"))
    }

    /// Appends to the file, creating it if absent.
    pub fn write(&self, uri: &Uri, data: &[u8]) -> Result<()> {
        self.check_uri(uri)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(uri.to_path())
            .wrap_err_with(|| format!("cannot open '{uri}' for writing"))?;
        file.write_all(data)
            .wrap_err_with(|| format!("cannot write {} bytes to '{uri}'", data.len()))
    }

    pub fn file_size(&self, uri: &Uri) -> Result<u64> {
        self.check_uri(uri)?;
        let meta = std::fs::metadata(uri.to_path())
            .wrap_err_with(|| format!("cannot stat '{uri}'"))?;
        Ok(meta.len())
    }

    pub fn sync(&self, uri: &Uri) -> Result<()> {
        self.check_uri(uri)?;
        let file = File::open(uri.to_path()).wrap_err_with(|| format!("cannot open '{uri}'"))?;
        file.sync_all().wrap_err_with(|| format!("cannot sync '{uri}'"))
    }

    /// Posix files need no explicit close; the handle-owning backends do.
    pub fn close_file(&self, uri: &Uri) -> Result<()> {
        self.check_uri(uri)
    }

    pub fn remove_file(&self, uri: &Uri) -> Result<()> {
        self.check_uri(uri)?;
        std::fs::remove_file(uri.to_path()).wrap_err_with(|| format!("cannot remove '{uri}'"))
    }

    pub fn remove_dir(&self, uri: &Uri) -> Result<()> {
        self.check_uri(uri)?;
        std::fs::remove_dir_all(uri.to_path())
            .wrap_err_with(|| format!("cannot remove directory '{uri}'"))
    }

    pub fn move_dir(&self, old_uri: &Uri, new_uri: &Uri) -> Result<()> {
        self.check_uri(old_uri)?;
        self.check_uri(new_uri)?;
        std::fs::rename(old_uri.to_path(), new_uri.to_path())
            .wrap_err_with(|| format!("cannot move '{old_uri}' to '{new_uri}'"))
    }

    /// Acquires an advisory lock on `uri`, blocking until granted. The
    /// returned handle owns the lock for its lifetime.
    pub fn filelock_lock(&self, uri: &Uri, shared: bool) -> Result<File> {
        self.check_uri(uri)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(uri.to_path())
            .map_err(|e| StorageError::lock_failure(uri.to_string(), e.to_string()))?;

        let locked = if shared {
            file.lock_shared()
        } else {
            file.lock_exclusive()
        };
        locked.map_err(|e| StorageError::lock_failure(uri.to_string(), e.to_string()))?;
        Ok(file)
    }

    pub fn filelock_unlock(&self, uri: &Uri, handle: &File) -> Result<()> {
        handle
            .unlock()
            .map_err(|e| StorageError::lock_failure(uri.to_string(), e.to_string()))?;
        Ok(())
    }

    /// Synchronous posix I/O runs on caller threads; there is no queued
    /// work to cancel. Remote backends sweep their task queues here.
    pub fn cancel_all_tasks(&self) -> Result<()> {
        Ok(())
    }

    /// Marks the VFS terminated; subsequent operations fail.
    pub fn terminate(&self) -> Result<()> {
        self.terminated.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn vfs() -> Vfs {
        Vfs::new(VfsConfig::default())
    }

    #[test]
    fn ls_returns_sorted_children() {
        let dir = tempdir().unwrap();
        let base = Uri::new(dir.path().to_string_lossy().to_string());
        let vfs = vfs();

        for name in ["zebra", "alpha", "mid"] {
            vfs.touch(&base.join_path(name)).unwrap();
        }

        let children = vfs.ls(&base).unwrap();
        let names: Vec<_> = children.iter().map(|u| u.last_path_part()).collect();
        assert_eq!(names, ["alpha", "mid", "zebra"]);
    }

    #[test]
    fn read_write_roundtrip_at_offset() {
        let dir = tempdir().unwrap();
        let uri = Uri::new(format!("{}/blob", dir.path().display()));
        let vfs = vfs();

        vfs.write(&uri, b"hello ").unwrap();
        vfs.write(&uri, b"world").unwrap();

        assert_eq!(vfs.file_size(&uri).unwrap(), 11);
        assert_eq!(vfs.read(&uri, 6, 5).unwrap(), b"world");
    }

    #[test]
    fn short_read_is_an_error() {
        let dir = tempdir().unwrap();
        let uri = Uri::new(format!("{}/blob", dir.path().display()));
        let vfs = vfs();
        vfs.write(&uri, b"abc").unwrap();
        assert!(vfs.read(&uri, 0, 10).is_err());
    }

    #[test]
    fn unsupported_scheme_rejected() {
        let vfs = vfs();
        let uri = Uri::new("s3://bucket/key");
        let err = vfs.is_file(&uri).unwrap_err();
        assert!(matches!(
            crate::error::storage_error(&err),
            Some(StorageError::InvalidUri(_))
        ));
    }

    #[test]
    fn shared_filelocks_coexist() {
        let dir = tempdir().unwrap();
        let uri = Uri::new(format!("{}/__lockfile", dir.path().display()));
        let vfs = vfs();
        vfs.touch(&uri).unwrap();

        let a = vfs.filelock_lock(&uri, true).unwrap();
        let b = vfs.filelock_lock(&uri, true).unwrap();
        vfs.filelock_unlock(&uri, &a).unwrap();
        vfs.filelock_unlock(&uri, &b).unwrap();

        let x = vfs.filelock_lock(&uri, false).unwrap();
        vfs.filelock_unlock(&uri, &x).unwrap();
    }

    #[test]
    fn filelock_on_missing_file_is_lock_failure() {
        let dir = tempdir().unwrap();
        let uri = Uri::new(format!("{}/absent", dir.path().display()));
        let err = vfs().filelock_lock(&uri, true).unwrap_err();
        assert!(matches!(
            crate::error::storage_error(&err),
            Some(StorageError::LockFailure { .. })
        ));
    }

    #[test]
    fn terminate_blocks_further_io() {
        let dir = tempdir().unwrap();
        let base = Uri::new(dir.path().to_string_lossy().to_string());
        let vfs = vfs();
        vfs.terminate().unwrap();
        assert!(vfs.ls(&base).is_err());
    }

    #[test]
    fn move_dir_renames() {
        let dir = tempdir().unwrap();
        let vfs = vfs();
        let old = Uri::new(format!("{}/a", dir.path().display()));
        let new = Uri::new(format!("{}/b", dir.path().display()));
        vfs.create_dir(&old).unwrap();
        vfs.move_dir(&old, &new).unwrap();
        assert!(!vfs.is_dir(&old).unwrap());
        assert!(vfs.is_dir(&new).unwrap());
    }
}
