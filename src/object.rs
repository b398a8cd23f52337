//! # Object Model
//!
//! Everything addressable in a storage hierarchy is an *object*: an
//! array, a key-value array, or a group (a directory of other objects).
//! A directory that carries none of the three sentinel files is not an
//! object at all and walks right past it.
//!
//! [`ObjectIter`] holds the state of a directory walk; the storage
//! manager drives it via `object_iter_begin` / `object_iter_next`. The
//! handle is opaque to callers and single-threaded by design.

use std::collections::VecDeque;

use crate::uri::Uri;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    Array,
    KeyValue,
    Group,
    Invalid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalkOrder {
    Preorder,
    Postorder,
}

/// Opaque state of an object walk.
pub struct ObjectIter {
    pub(crate) objs: VecDeque<Uri>,
    /// Parallel to `objs` in postorder walks: whether the entry's
    /// children have been pushed already.
    pub(crate) expanded: VecDeque<bool>,
    pub(crate) order: WalkOrder,
    pub(crate) recursive: bool,
}
