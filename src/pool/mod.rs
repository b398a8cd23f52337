//! # Worker Pools and Cancelable Tasks
//!
//! The storage manager owns three [`ThreadPool`]s sized from config:
//! async query submission, fragment-metadata reads, and schema/metadata
//! writes. Synchronous API calls stay on the caller's thread; only work
//! explicitly handed to a pool runs elsewhere.
//!
//! ## Queue Discipline
//!
//! Jobs land in a FIFO guarded by a `parking_lot::Mutex` + `Condvar`;
//! idle workers sleep on the condvar. Dropping the pool flips a shutdown
//! flag, wakes every worker, and joins them — queued jobs drain first,
//! nothing is abandoned mid-run.
//!
//! ## Bounded Data Parallelism
//!
//! [`ThreadPool::parallel_for`] fans a closure over an index range using
//! scoped workers capped at the pool's width, so borrowed state (an open
//! array entry, the VFS) flows in without `'static` gymnastics. Indices
//! are claimed from a shared atomic counter, which keeps the slowest
//! item from serializing a whole stripe.
//!
//! ## Cancelable Tasks
//!
//! [`CancelableTasks`] pairs each queued job with a cancel closure. A
//! worker claims a task by removing it from the pending map before
//! running it; `cancel_all` drains the map and runs the cancel closures
//! of everything still unclaimed. The two paths race on the same map
//! entry, so a task either runs or is cancelled, never both, and a
//! cancelled task is guaranteed not to have started.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use eyre::Result;
use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct QueueState {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

struct PoolShared {
    queue: Mutex<QueueState>,
    available: Condvar,
}

pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<JoinHandle<()>>,
    num_threads: usize,
}

impl ThreadPool {
    pub fn new(num_threads: usize) -> Self {
        let num_threads = num_threads.max(1);
        let shared = Arc::new(PoolShared {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            available: Condvar::new(),
        });

        let workers = (0..num_threads)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || worker_loop(&shared))
            })
            .collect();

        Self {
            shared,
            workers,
            num_threads,
        }
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    /// Queues a job for execution on some worker.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        {
            let mut queue = self.shared.queue.lock();
            queue.jobs.push_back(Box::new(job));
        }
        self.shared.available.notify_one();
    }

    /// Runs `f(i)` for every `i` in `begin..end` with parallelism capped
    /// at the pool width, returning one `Result` per index in order.
    /// Blocks until the whole range has been processed.
    pub fn parallel_for<F>(&self, begin: usize, end: usize, f: F) -> Vec<Result<()>>
    where
        F: Fn(usize) -> Result<()> + Send + Sync,
    {
        let n = end.saturating_sub(begin);
        if n == 0 {
            return Vec::new();
        }

        let mut results: Vec<Result<()>> = Vec::with_capacity(n);
        results.extend((0..n).map(|_| Ok(())));
        let results = Mutex::new(results);
        let next = AtomicUsize::new(begin);
        let width = self.num_threads.min(n);

        std::thread::scope(|scope| {
            for _ in 0..width {
                scope.spawn(|| loop {
                    let i = next.fetch_add(1, Ordering::Relaxed);
                    if i >= end {
                        break;
                    }
                    let r = f(i);
                    results.lock()[i - begin] = r;
                });
            }
        });

        results.into_inner()
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shared.queue.lock().shutdown = true;
        self.shared.available.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(shared: &PoolShared) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    break Some(job);
                }
                if queue.shutdown {
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };
        match job {
            Some(job) => job(),
            None => return,
        }
    }
}

type CancelFn = Box<dyn FnOnce() + Send + 'static>;

struct TasksInner {
    pending: Mutex<HashMap<u64, CancelFn>>,
    next_id: AtomicU64,
}

/// Registry of queued-but-unstarted tasks, shared between the enqueue
/// path and `cancel_all`. Cheap to clone.
#[derive(Clone)]
pub struct CancelableTasks {
    inner: Arc<TasksInner>,
}

impl CancelableTasks {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TasksInner {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Queues `run` on `pool`. If `cancel_all` sweeps the queue before a
    /// worker claims the task, `cancel` runs instead and `run` never does.
    pub fn enqueue<R, C>(&self, pool: &ThreadPool, run: R, cancel: C)
    where
        R: FnOnce() + Send + 'static,
        C: FnOnce() + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.pending.lock().insert(id, Box::new(cancel));

        let inner = Arc::clone(&self.inner);
        pool.execute(move || {
            // Claim the task; a missing entry means it was cancelled.
            let claimed = inner.pending.lock().remove(&id).is_some();
            if claimed {
                run();
            }
        });
    }

    /// Drains every unclaimed task and runs its cancel closure.
    pub fn cancel_all(&self) {
        let drained: Vec<CancelFn> = {
            let mut pending = self.inner.pending.lock();
            pending.drain().map(|(_, cancel)| cancel).collect()
        };
        for cancel in drained {
            cancel();
        }
    }

    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }
}

impl Default for CancelableTasks {
    fn default() -> Self {
        Self::new()
    }
}
