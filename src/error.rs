//! # Error Taxonomy
//!
//! Public API calls return `eyre::Result`, but every failure that callers
//! need to distinguish carries a [`StorageError`] at the root of the report
//! chain. Classify with `err.downcast_ref::<StorageError>()`.
//!
//! ## Kinds
//!
//! | Kind                 | Meaning                                           |
//! |----------------------|---------------------------------------------------|
//! | `InvalidUri`         | Malformed path or unsupported scheme              |
//! | `NotFound`           | Array/group/object absent at the given URI        |
//! | `EncryptionMismatch` | Key disagrees with a concurrently open entry      |
//! | `LockFailure`        | Filelock acquire/release failed at the VFS layer  |
//! | `SchemaLoad`         | Array schema deserialization or read error        |
//! | `FragmentLoad`       | Fragment metadata deserialization or read error   |
//! | `Cancelled`          | Operation aborted by a cancel request             |
//! | `Internal`           | Invariant violation (e.g. unparseable timestamp)  |
//!
//! ## Rollback Contract
//!
//! Errors surface only after partial state has been rolled back: entry
//! mutexes released, reference counts restored, filelocks dropped, and
//! freshly created registry entries removed.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("invalid URI '{0}'")]
    InvalidUri(String),

    #[error("object does not exist at '{0}'")]
    NotFound(String),

    #[error("encryption key mismatch for array '{0}'")]
    EncryptionMismatch(String),

    #[error("filelock failure on '{uri}': {reason}")]
    LockFailure { uri: String, reason: String },

    #[error("cannot load array schema from '{0}'")]
    SchemaLoad(String),

    #[error("cannot load fragment metadata from '{0}'")]
    FragmentLoad(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl StorageError {
    pub fn lock_failure(uri: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LockFailure {
            uri: uri.into(),
            reason: reason.into(),
        }
    }
}

/// Returns the `StorageError` at the root of an `eyre` report, if any.
pub fn storage_error(report: &eyre::Report) -> Option<&StorageError> {
    report.downcast_ref::<StorageError>()
}

#[cfg(test)]
mod tests {
    use super::*;
    use eyre::WrapErr;

    #[test]
    fn kinds_survive_context_wrapping() {
        let err: eyre::Report = StorageError::NotFound("file:///tmp/a".into()).into();
        let err = Err::<(), _>(err)
            .wrap_err("cannot open array")
            .unwrap_err();

        assert!(matches!(
            storage_error(&err),
            Some(StorageError::NotFound(_))
        ));
    }

    #[test]
    fn lock_failure_formats_uri_and_reason() {
        let err = StorageError::lock_failure("file:///tmp/a/__lockfile", "EACCES");
        assert_eq!(
            err.to_string(),
            "filelock failure on 'file:///tmp/a/__lockfile': EACCES"
        );
    }
}
