//! # Query Interface
//!
//! Query execution lives outside the storage manager; this module defines
//! the seam between the two. A [`Query`] is anything the coordinator can
//! run synchronously (`process`) and abort cooperatively (`cancel`).
//!
//! Long-running queries are expected to poll
//! `StorageManager::cancellation_in_progress()` at safe points and return
//! a `Cancelled` error when it is set. The storage manager never preempts.

use eyre::Result;

/// Whether an array is opened for reading or writing. The open-array
/// registry keeps disjoint maps per query type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueryType {
    Read,
    Write,
}

/// A runnable unit of query execution.
///
/// `process` is invoked at most once per submission, on the caller's
/// thread for synchronous submits or on an async worker otherwise.
/// `cancel` is only invoked for async submissions whose task had not yet
/// started when a cancellation swept the queue.
pub trait Query: Send + Sync {
    fn query_type(&self) -> QueryType;

    fn process(&self) -> Result<()>;

    fn cancel(&self);
}
