//! # Object Typing, Iteration, and Hierarchy Ops
//!
//! An object is whatever a sentinel file says it is:
//! `__tiledb_group.tdb` makes a group, `__kv_schema.tdb` a key-value
//! array, `__array_schema.tdb` an array. Directories without a sentinel
//! are invisible to walks, removes, and moves.
//!
//! ## Walk Orders
//!
//! - **Preorder** emits a node before its children; recursion pushes
//!   the children reversed onto the front of the work list so the first
//!   child is processed next.
//! - **Postorder** is always recursive. Each entry carries an
//!   `expanded` flag; the front entry is expanded to a fixpoint (its
//!   children, their children, ...) before it is emitted, so leaves
//!   come out first.

use eyre::Result;

use super::StorageManager;
use crate::config::{
    ARRAY_SCHEMA_FILENAME, FRAGMENT_METADATA_FILENAME, GROUP_FILENAME, KV_SCHEMA_FILENAME,
};
use crate::error::StorageError;
use crate::object::{ObjectIter, ObjectType, WalkOrder};
use crate::uri::Uri;

impl StorageManager {
    /* ---------------- probes ---------------- */

    pub fn is_array(&self, uri: &Uri) -> Result<bool> {
        self.vfs.is_file(&uri.join_path(ARRAY_SCHEMA_FILENAME))
    }

    pub fn is_kv(&self, uri: &Uri) -> Result<bool> {
        self.vfs.is_file(&uri.join_path(KV_SCHEMA_FILENAME))
    }

    pub fn is_group(&self, uri: &Uri) -> Result<bool> {
        self.vfs.is_file(&uri.join_path(GROUP_FILENAME))
    }

    pub fn is_fragment(&self, uri: &Uri) -> Result<bool> {
        self.vfs.is_file(&uri.join_path(FRAGMENT_METADATA_FILENAME))
    }

    /// Classifies the object at `uri` by scanning its children for the
    /// sentinel files. Non-directories are `Invalid`.
    pub fn object_type(&self, uri: &Uri) -> Result<ObjectType> {
        if !self.vfs.is_dir(uri)? {
            return Ok(ObjectType::Invalid);
        }

        let children = self.vfs.ls(&uri.add_trailing_slash())?;
        for child in &children {
            match child.last_path_part() {
                GROUP_FILENAME => return Ok(ObjectType::Group),
                KV_SCHEMA_FILENAME => return Ok(ObjectType::KeyValue),
                ARRAY_SCHEMA_FILENAME => return Ok(ObjectType::Array),
                _ => {}
            }
        }
        Ok(ObjectType::Invalid)
    }

    /* ---------------- groups ---------------- */

    /// Creates a group directory with its marker file; rolls the
    /// directory back if the marker cannot be written.
    pub fn group_create(&self, group_uri: &Uri) -> Result<()> {
        if group_uri.is_invalid() {
            return Err(StorageError::InvalidUri(group_uri.to_string()).into());
        }
        if self.is_group(group_uri)? {
            return Err(StorageError::Internal(format!(
                "group '{group_uri}' already exists"
            ))
            .into());
        }

        let _create = self.object_create_mtx.lock();

        self.vfs.create_dir(group_uri)?;
        if let Err(e) = self.vfs.touch(&group_uri.join_path(GROUP_FILENAME)) {
            let _ = self.vfs.remove_dir(group_uri);
            return Err(e);
        }
        Ok(())
    }

    /* ---------------- remove & move ---------------- */

    /// Removes an object's whole directory. Refuses paths that are not
    /// objects.
    pub fn object_remove(&self, path: &str) -> Result<()> {
        let uri = Uri::new(path);
        if uri.is_invalid() {
            return Err(StorageError::InvalidUri(path.to_string()).into());
        }
        if self.object_type(&uri)? == ObjectType::Invalid {
            return Err(StorageError::NotFound(path.to_string()).into());
        }
        self.vfs.remove_dir(&uri)
    }

    /// Renames an object's directory. Refuses paths that are not
    /// objects.
    pub fn object_move(&self, old_path: &str, new_path: &str) -> Result<()> {
        let old_uri = Uri::new(old_path);
        if old_uri.is_invalid() {
            return Err(StorageError::InvalidUri(old_path.to_string()).into());
        }
        let new_uri = Uri::new(new_path);
        if new_uri.is_invalid() {
            return Err(StorageError::InvalidUri(new_path.to_string()).into());
        }
        if self.object_type(&old_uri)? == ObjectType::Invalid {
            return Err(StorageError::NotFound(old_path.to_string()).into());
        }
        self.vfs.move_dir(&old_uri, &new_uri)
    }

    /* ---------------- iteration ---------------- */

    /// Starts a recursive walk over the objects under `path`.
    pub fn object_iter_begin(&self, path: &Uri, order: WalkOrder) -> Result<ObjectIter> {
        self.iter_begin(path, order, true)
    }

    /// Starts a non-recursive preorder walk: only the objects directly
    /// under `path`.
    pub fn object_iter_begin_non_recursive(&self, path: &Uri) -> Result<ObjectIter> {
        self.iter_begin(path, WalkOrder::Preorder, false)
    }

    fn iter_begin(&self, path: &Uri, order: WalkOrder, recursive: bool) -> Result<ObjectIter> {
        if path.is_invalid() {
            return Err(StorageError::InvalidUri(path.to_string()).into());
        }

        let mut iter = ObjectIter {
            objs: Default::default(),
            expanded: Default::default(),
            order,
            recursive,
        };
        for child in self.vfs.ls(&path.add_trailing_slash())? {
            if self.object_type(&child)? != ObjectType::Invalid {
                iter.objs.push_back(child);
                if order == WalkOrder::Postorder {
                    iter.expanded.push_back(false);
                }
            }
        }
        Ok(iter)
    }

    /// Advances the walk; `None` when exhausted.
    pub fn object_iter_next(&self, iter: &mut ObjectIter) -> Result<Option<(Uri, ObjectType)>> {
        if iter.objs.is_empty() {
            return Ok(None);
        }
        match iter.order {
            WalkOrder::Preorder => self.iter_next_preorder(iter),
            WalkOrder::Postorder => self.iter_next_postorder(iter),
        }
    }

    fn iter_next_preorder(&self, iter: &mut ObjectIter) -> Result<Option<(Uri, ObjectType)>> {
        let front = match iter.objs.pop_front() {
            Some(front) => front,
            None => return Ok(None),
        };
        let object_type = self.object_type(&front)?;

        if iter.recursive {
            let children = self.vfs.ls(&front.add_trailing_slash())?;
            for child in children.iter().rev() {
                if self.object_type(child)? != ObjectType::Invalid {
                    iter.objs.push_front(child.clone());
                }
            }
        }

        Ok(Some((front, object_type)))
    }

    fn iter_next_postorder(&self, iter: &mut ObjectIter) -> Result<Option<(Uri, ObjectType)>> {
        // Expand the front entry to a fixpoint before emitting it.
        while let Some(false) = iter.expanded.front().copied() {
            let front = match iter.objs.front() {
                Some(front) => front.clone(),
                None => return Ok(None),
            };

            let children = self.vfs.ls(&front.add_trailing_slash())?;
            if let Some(expanded) = iter.expanded.front_mut() {
                *expanded = true;
            }
            for child in children.iter().rev() {
                if self.object_type(child)? != ObjectType::Invalid {
                    iter.objs.push_front(child.clone());
                    iter.expanded.push_front(false);
                }
            }
        }

        let front = match iter.objs.pop_front() {
            Some(front) => front,
            None => return Ok(None),
        };
        iter.expanded.pop_front();
        let object_type = self.object_type(&front)?;
        Ok(Some((front, object_type)))
    }
}
