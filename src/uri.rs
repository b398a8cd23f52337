//! # URI Handling
//!
//! Arrays, groups, and fragments are addressed by URIs. A [`Uri`] is an
//! opaque path with a small set of operations; its canonical string form
//! keys every registry in the storage manager, so two opens of the same
//! string always intern to the same entry.
//!
//! Supported schemes:
//!
//! - `file://` — explicit posix path
//! - no scheme — treated as a posix path
//!
//! Any other scheme parses but is rejected by the VFS dispatch at open
//! time. Ordering (`Ord`) is plain byte ordering of the canonical string;
//! the fragment selector relies on this as its tie-break.

use std::fmt;
use std::path::PathBuf;

pub const FILE_SCHEME: &str = "file";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Uri(String);

impl Uri {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// A URI is invalid when it is empty. Scheme support is the VFS's call.
    pub fn is_invalid(&self) -> bool {
        self.0.is_empty()
    }

    /// The scheme portion (`file` in `file:///x`), or `None` for plain paths.
    pub fn scheme(&self) -> Option<&str> {
        let idx = self.0.find("://")?;
        Some(&self.0[..idx])
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Appends a path component, normalizing the separator.
    pub fn join_path(&self, part: &str) -> Uri {
        let base = self.0.trim_end_matches('/');
        Uri(format!("{base}/{part}"))
    }

    /// The basename, ignoring any trailing slash.
    pub fn last_path_part(&self) -> &str {
        let trimmed = self.0.trim_end_matches('/');
        match trimmed.rfind('/') {
            Some(idx) => &trimmed[idx + 1..],
            None => trimmed,
        }
    }

    pub fn add_trailing_slash(&self) -> Uri {
        if self.0.ends_with('/') {
            self.clone()
        } else {
            Uri(format!("{}/", self.0))
        }
    }

    /// Filesystem path for the posix backend (strips a `file://` prefix).
    pub fn to_path(&self) -> PathBuf {
        match self.0.strip_prefix("file://") {
            Some(rest) => PathBuf::from(rest),
            None => PathBuf::from(&self.0),
        }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Uri {
    fn from(s: &str) -> Self {
        Uri::new(s)
    }
}

impl From<String> for Uri {
    fn from(s: String) -> Self {
        Uri::new(s)
    }
}
