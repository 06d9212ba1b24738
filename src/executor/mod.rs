//! Worker executors: run units of work on persistent worker threads.
//!
//! ## Core types
//!
//! - [`Executor`]: the worker-pool contract the connection pool builds on.
//! - [`WorkerId`]: executor-assigned identity of a worker slot.
//! - [`ThreadPool`]: bounded pool of OS threads, grown on demand from `min` to `max`.
//! - [`InlineExecutor`]: runs jobs on the submitting thread with simulated workers.
//!
//! While a job runs, its worker id is also published in worker-local storage and
//! can be read back with [`current_worker`]. Each entry is tagged with the
//! [`ScopeId`] of the executor (or pool) that owns the worker, so
//! [`worker_in`] only answers for workers of that scope, even when one
//! scope's job runs work for another on the same thread.

use std::cell::RefCell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::PoolResult;

pub mod inline;
pub mod thread_pool;

pub use inline::InlineExecutor;
pub use thread_pool::ThreadPool;

/// Identity of a worker slot, assigned by the executor when the worker is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(usize);

impl WorkerId {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker-{}", self.0)
    }
}

/// Process-unique identity of a group of workers: one executor, or one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Allocates a fresh id.
    pub fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(0);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// A unit of work handed to an executor. It receives the worker it runs on.
pub type Job = Box<dyn FnOnce(WorkerId) + Send + 'static>;

/// The worker-pool contract.
///
/// # Contract
///
/// - `execute` either rejects the job with an error or accepts it. An accepted
///   job runs exactly once on some worker, or is dropped if the executor stops
///   before any worker picks it up. It never runs twice.
/// - Jobs submitted before `start` are queued until the executor starts.
/// - `stop` lets in-flight and queued work finish, then rejects further submissions.
///   It is idempotent.
pub trait Executor: Send + Sync + 'static {
    fn start(&self) -> PoolResult<()>;

    fn stop(&self);

    fn execute(&self, job: Job) -> PoolResult<()>;
}

thread_local! {
    // Innermost scope last.
    static ACTIVE: RefCell<Vec<(ScopeId, WorkerId)>> = const { RefCell::new(Vec::new()) };
}

/// Returns the worker running the innermost job on this thread, or `None`
/// off a worker.
pub fn current_worker() -> Option<WorkerId> {
    ACTIVE.with(|active| active.borrow().last().map(|&(_, worker)| worker))
}

/// Returns the worker of `scope` running on this thread, if any.
pub fn worker_in(scope: ScopeId) -> Option<WorkerId> {
    ACTIVE.with(|active| {
        active
            .borrow()
            .iter()
            .rev()
            .find(|(entry, _)| *entry == scope)
            .map(|&(_, worker)| worker)
    })
}

/// Runs `f` with `worker` of `scope` published as the current worker.
pub(crate) fn run_as<T>(scope: ScopeId, worker: WorkerId, f: impl FnOnce() -> T) -> T {
    struct Exit;

    impl Drop for Exit {
        fn drop(&mut self) {
            ACTIVE.with(|active| {
                active.borrow_mut().pop();
            });
        }
    }

    ACTIVE.with(|active| active.borrow_mut().push((scope, worker)));
    let _exit = Exit;
    f()
}
