//! # Exclusive-Lock Protocol
//!
//! Consolidation needs the array to itself: no intra-process readers,
//! no cross-process shared filelock holders. Two layers provide that:
//!
//! 1. [`ExclusiveGate`] — intra-process. Entry creation in the reads
//!    registry holds it shared for the duration of the registry
//!    critical section; `array_xlock` holds it exclusive from `xlock`
//!    until `xunlock`, which is why it is a hand-rolled gate rather
//!    than an `RwLock` (guards cannot cross method boundaries).
//! 2. The exclusive filelock on `<array>/__lockfile` — cross-process.
//!    Acquired only after the reads registry has drained.
//!
//! ## Drain
//!
//! `array_xlock` waits on the manager's condition variable with the
//! reads-registry guard; every read-close notifies it. The wait
//! atomically releases and reacquires the registry mutex, so a close
//! can never slip between the predicate check and the sleep.
//!
//! ## Lock Order
//!
//! Gate, then registry, then per-entry mutex, then filelock —
//! everywhere. The gate is first so that a blocked opener never holds
//! the registry mutex while the xlock holder needs it to drain.

use eyre::Result;
use parking_lot::{Condvar, Mutex};

use super::StorageManager;
use crate::config::FILELOCK_NAME;
use crate::error::StorageError;
use crate::uri::Uri;

#[derive(Default)]
struct GateState {
    exclusive: bool,
    shared: u32,
}

/// Shared/exclusive gate whose exclusive side can be held across
/// method calls.
pub(crate) struct ExclusiveGate {
    state: Mutex<GateState>,
    cv: Condvar,
}

impl ExclusiveGate {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GateState::default()),
            cv: Condvar::new(),
        }
    }

    /// Blocks while an exclusive holder is active.
    pub fn lock_shared(&self) -> SharedGateGuard<'_> {
        let mut state = self.state.lock();
        while state.exclusive {
            self.cv.wait(&mut state);
        }
        state.shared += 1;
        SharedGateGuard { gate: self }
    }

    /// Blocks until no holder of either mode remains.
    pub fn lock_exclusive(&self) {
        let mut state = self.state.lock();
        while state.exclusive || state.shared > 0 {
            self.cv.wait(&mut state);
        }
        state.exclusive = true;
    }

    pub fn unlock_exclusive(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.exclusive, "unlock_exclusive without holder");
        state.exclusive = false;
        drop(state);
        self.cv.notify_all();
    }

    fn unlock_shared(&self) {
        let mut state = self.state.lock();
        debug_assert!(state.shared > 0, "unlock_shared without holder");
        state.shared -= 1;
        let drained = state.shared == 0;
        drop(state);
        if drained {
            self.cv.notify_all();
        }
    }
}

pub(crate) struct SharedGateGuard<'a> {
    gate: &'a ExclusiveGate,
}

impl Drop for SharedGateGuard<'_> {
    fn drop(&mut self) {
        self.gate.unlock_shared();
    }
}

impl StorageManager {
    /// Acquires the exclusive lock on an array: blocks new intra-process
    /// readers, waits until existing ones close, then takes the
    /// exclusive filelock for cross-process exclusion. Strictly paired
    /// with [`StorageManager::array_xunlock`].
    pub fn array_xlock(&self, array_uri: &Uri) -> Result<()> {
        self.xlock_gate.lock_exclusive();

        let mut reads = self.open_arrays_for_reads.lock();
        while reads.contains_key(array_uri.as_str()) {
            self.xlock_cv.wait(&mut reads);
        }

        let lock_uri = array_uri.join_path(FILELOCK_NAME);
        match self.vfs.filelock_lock(&lock_uri, false) {
            Ok(handle) => {
                self.xfilelocks
                    .lock()
                    .insert(array_uri.to_string(), handle);
                tracing::debug!(array = %array_uri, "exclusive lock acquired");
                Ok(())
            }
            Err(e) => {
                drop(reads);
                self.xlock_gate.unlock_exclusive();
                Err(e)
            }
        }
    }

    /// Releases the exclusive lock taken by `array_xlock`. Fails if no
    /// lock was recorded for this URI; the gate stays held in that case
    /// so a mispaired caller cannot silently unblock readers.
    pub fn array_xunlock(&self, array_uri: &Uri) -> Result<()> {
        let lock_uri = array_uri.join_path(FILELOCK_NAME);
        {
            let mut xfilelocks = self.xfilelocks.lock();
            let handle = xfilelocks.get(array_uri.as_str()).ok_or_else(|| {
                StorageError::lock_failure(
                    array_uri.to_string(),
                    "no exclusive filelock recorded",
                )
            })?;
            self.vfs.filelock_unlock(&lock_uri, handle)?;
            xfilelocks.remove(array_uri.as_str());
        }

        self.xlock_gate.unlock_exclusive();
        tracing::debug!(array = %array_uri, "exclusive lock released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn shared_holders_coexist() {
        let gate = ExclusiveGate::new();
        let a = gate.lock_shared();
        let b = gate.lock_shared();
        drop(a);
        drop(b);
    }

    #[test]
    fn exclusive_waits_for_shared_drain() {
        let gate = Arc::new(ExclusiveGate::new());
        let acquired = Arc::new(AtomicBool::new(false));

        let shared = gate.lock_shared();

        let gate2 = Arc::clone(&gate);
        let acquired2 = Arc::clone(&acquired);
        let waiter = std::thread::spawn(move || {
            gate2.lock_exclusive();
            acquired2.store(true, Ordering::Release);
            gate2.unlock_exclusive();
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::Acquire));

        drop(shared);
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::Acquire));
    }

    #[test]
    fn shared_waits_for_exclusive_release() {
        let gate = Arc::new(ExclusiveGate::new());
        gate.lock_exclusive();

        let gate2 = Arc::clone(&gate);
        let acquired = Arc::new(AtomicBool::new(false));
        let acquired2 = Arc::clone(&acquired);
        let waiter = std::thread::spawn(move || {
            let _g = gate2.lock_shared();
            acquired2.store(true, Ordering::Release);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!acquired.load(Ordering::Acquire));

        gate.unlock_exclusive();
        waiter.join().unwrap();
        assert!(acquired.load(Ordering::Acquire));
    }
}
