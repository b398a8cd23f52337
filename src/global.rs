//! # Process-Global Coordinator Registry
//!
//! Signal-driven shutdown needs a way to reach every live storage
//! manager in the process. Each manager registers its cancellation
//! state at construction and unregisters at drop;
//! [`cancel_all_managers`] sweeps whatever is still alive.
//!
//! The registry holds `Weak` references, so it never extends a
//! manager's lifetime and a manager that skipped unregistration (e.g.
//! after a panic mid-drop) degrades to a dead entry rather than a leak.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{OnceLock, Weak};

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::manager::cancel::Cancellation;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn registry() -> &'static Mutex<HashMap<u64, Weak<Cancellation>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<u64, Weak<Cancellation>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

pub(crate) fn next_manager_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub(crate) fn register(id: u64, cancellation: Weak<Cancellation>) {
    registry().lock().insert(id, cancellation);
}

pub(crate) fn unregister(id: u64) {
    registry().lock().remove(&id);
}

/// Cancels the outstanding work of every live storage manager. Intended
/// for signal handlers' worker threads; errors are logged per manager
/// and do not stop the sweep.
pub fn cancel_all_managers() {
    let live: Vec<Weak<Cancellation>> = registry().lock().values().cloned().collect();
    for weak in live {
        if let Some(cancellation) = weak.upgrade() {
            if let Err(e) = cancellation.cancel_all_tasks() {
                tracing::warn!(error = %e, "cancellation sweep failed for a manager");
            }
        }
    }
}
