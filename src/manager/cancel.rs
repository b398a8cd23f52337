//! # Cancellation and Quiescence
//!
//! [`Cancellation`] is the shared state behind `cancel_all_tasks`: the
//! cancel flag, the in-progress query counter, and handles to the
//! cancelable task queue and the VFS. It lives in an `Arc` so the
//! process-global registry can reach it after the owning manager has
//! started tearing down.
//!
//! ## Protocol
//!
//! 1. Check-and-set the flag under its mutex. A second concurrent call
//!    sees the flag already set and returns immediately.
//! 2. Sweep the async task queue: unstarted tasks are dropped and their
//!    cancel closures run.
//! 3. Tell the VFS to cancel outstanding I/O.
//! 4. Wait on the in-progress condvar until the counter hits zero.
//!    Running queries observe `in_progress()` at their own checkpoints
//!    and drain cooperatively.
//! 5. Clear the flag.
//!
//! [`QueryInProgress`] is the RAII bracket around query execution; the
//! counter is decremented on every exit path because the guard's drop
//! runs even when `process()` errors.

use std::sync::Arc;

use eyre::Result;
use parking_lot::{Condvar, Mutex};

use crate::pool::CancelableTasks;
use crate::vfs::Vfs;

pub struct Cancellation {
    queries_in_progress: Mutex<u64>,
    queries_cv: Condvar,
    cancelling: Mutex<bool>,
    tasks: CancelableTasks,
    vfs: Arc<Vfs>,
}

impl Cancellation {
    pub(crate) fn new(tasks: CancelableTasks, vfs: Arc<Vfs>) -> Self {
        Self {
            queries_in_progress: Mutex::new(0),
            queries_cv: Condvar::new(),
            cancelling: Mutex::new(false),
            tasks,
            vfs,
        }
    }

    pub fn in_progress(&self) -> bool {
        *self.cancelling.lock()
    }

    pub fn queries_in_progress(&self) -> u64 {
        *self.queries_in_progress.lock()
    }

    fn increment_in_progress(&self) {
        *self.queries_in_progress.lock() += 1;
        self.queries_cv.notify_all();
    }

    fn decrement_in_progress(&self) {
        let mut count = self.queries_in_progress.lock();
        debug_assert!(*count > 0, "in-progress counter underflow");
        *count = count.saturating_sub(1);
        self.queries_cv.notify_all();
    }

    fn wait_for_zero_in_progress(&self) {
        let mut count = self.queries_in_progress.lock();
        while *count != 0 {
            self.queries_cv.wait(&mut count);
        }
    }

    /// Idempotent, concurrent-safe cancellation sweep. Returns once
    /// every in-progress query has drained.
    pub fn cancel_all_tasks(&self) -> Result<()> {
        {
            let mut cancelling = self.cancelling.lock();
            if *cancelling {
                return Ok(());
            }
            *cancelling = true;
        }

        self.tasks.cancel_all();
        if let Err(e) = self.vfs.cancel_all_tasks() {
            tracing::warn!(error = %e, "VFS cancellation failed");
        }

        self.wait_for_zero_in_progress();

        *self.cancelling.lock() = false;
        Ok(())
    }
}

/// Brackets one query execution in the in-progress counter.
pub(crate) struct QueryInProgress<'a> {
    cancellation: &'a Cancellation,
}

impl<'a> QueryInProgress<'a> {
    pub fn new(cancellation: &'a Cancellation) -> Self {
        cancellation.increment_in_progress();
        Self { cancellation }
    }
}

impl Drop for QueryInProgress<'_> {
    fn drop(&mut self) {
        self.cancellation.decrement_in_progress();
    }
}
