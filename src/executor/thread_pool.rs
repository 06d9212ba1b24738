//! Bounded pool of persistent OS worker threads.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use super::{Executor, Job, ScopeId, WorkerId, run_as};
use crate::error::{PoolError, PoolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct Queue {
    jobs: VecDeque<Job>,
    phase: Phase,
    // Live worker threads.
    workers: usize,
    // Workers parked on the condvar waiting for a job.
    idle: usize,
    next_id: usize,
    handles: Vec<JoinHandle<()>>,
}

struct Shared {
    scope: ScopeId,
    queue: Mutex<Queue>,
    available: Condvar,
}

/// A bounded pool of worker threads.
///
/// `start` spawns `min` workers. Whenever a job is queued and no worker is idle,
/// another worker is spawned, up to `max`. Workers live until [`stop`](Executor::stop).
/// Each worker gets a fresh [`WorkerId`] and keeps it for its whole life.
///
/// The queue is unbounded: once `max` workers are busy, further jobs wait in
/// memory until a worker frees up.
///
/// # Examples
///
/// ```
/// use std::sync::mpsc;
/// use affinity_pool::executor::{Executor, ThreadPool};
///
/// let pool = ThreadPool::new("db", 1, 2);
/// pool.start().unwrap();
///
/// let (tx, rx) = mpsc::channel();
/// pool.execute(Box::new(move |worker| tx.send(worker).unwrap())).unwrap();
/// let worker = rx.recv().unwrap();
/// assert_eq!(worker.index(), 0);
///
/// pool.stop();
/// ```
pub struct ThreadPool {
    name: String,
    min: usize,
    max: usize,
    shared: Arc<Shared>,
}

impl ThreadPool {
    /// Creates a stopped pool. `min` is clamped to `max`; `max` is at least 1.
    pub fn new(name: impl Into<String>, min: usize, max: usize) -> Self {
        let max = max.max(1);
        Self {
            name: name.into(),
            min: min.min(max),
            max,
            shared: Arc::new(Shared {
                scope: ScopeId::next(),
                queue: Mutex::new(Queue {
                    jobs: VecDeque::new(),
                    phase: Phase::Idle,
                    workers: 0,
                    idle: 0,
                    next_id: 0,
                    handles: Vec::new(),
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub fn min(&self) -> usize {
        self.min
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Scope tagging this pool's workers; see [`worker_in`](super::worker_in).
    pub fn scope(&self) -> ScopeId {
        self.shared.scope
    }

    /// Number of live worker threads.
    pub fn workers(&self) -> usize {
        self.shared.queue.lock().workers
    }

    /// Number of jobs waiting for a worker.
    pub fn queued(&self) -> usize {
        self.shared.queue.lock().jobs.len()
    }

    // Spawns workers until the queue can be served or `max` is reached.
    fn grow(&self, queue: &mut Queue) -> PoolResult<()> {
        while queue.workers < self.max
            && (queue.workers < self.min || queue.idle < queue.jobs.len())
        {
            let worker = WorkerId::new(queue.next_id);
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.name, worker.index()))
                .spawn(move || work_loop(shared, worker))?;

            debug!(pool = %self.name, %worker, "spawned worker");
            queue.next_id += 1;
            queue.workers += 1;
            // Counted idle until it picks up a job, so it is not spawned twice for one job.
            queue.idle += 1;
            queue.handles.push(handle);
        }
        Ok(())
    }
}

fn work_loop(shared: Arc<Shared>, worker: WorkerId) {
    loop {
        let job = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    queue.idle -= 1;
                    break Some(job);
                }
                if queue.phase == Phase::Stopped {
                    queue.idle -= 1;
                    queue.workers -= 1;
                    break None;
                }
                shared.available.wait(&mut queue);
            }
        };

        let Some(job) = job else {
            debug!(%worker, "worker exiting");
            return;
        };

        if panic::catch_unwind(AssertUnwindSafe(|| run_as(shared.scope, worker, || job(worker)))).is_err() {
            error!(%worker, "job panicked; worker continues");
        }

        shared.queue.lock().idle += 1;
    }
}

impl Executor for ThreadPool {
    fn start(&self) -> PoolResult<()> {
        let mut queue = self.shared.queue.lock();
        match queue.phase {
            Phase::Running => return Ok(()),
            Phase::Stopped => {
                return Err(PoolError::Lifecycle(format!(
                    "thread pool {} cannot be restarted",
                    self.name
                )));
            }
            Phase::Idle => {}
        }
        queue.phase = Phase::Running;
        debug!(pool = %self.name, min = self.min, max = self.max, "starting thread pool");
        self.grow(&mut queue)?;
        drop(queue);
        self.shared.available.notify_all();
        Ok(())
    }

    fn stop(&self) {
        let handles = {
            let mut queue = self.shared.queue.lock();
            if queue.phase == Phase::Stopped {
                return;
            }
            let was_running = queue.phase == Phase::Running;
            queue.phase = Phase::Stopped;
            if !was_running && !queue.jobs.is_empty() {
                warn!(
                    pool = %self.name,
                    dropped = queue.jobs.len(),
                    "stopping a pool that never started; queued jobs are dropped"
                );
                queue.jobs.clear();
            }
            std::mem::take(&mut queue.handles)
        };
        self.shared.available.notify_all();

        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() == current {
                // Stopped from inside one of our own workers; it exits once its job returns.
                continue;
            }
            if handle.join().is_err() {
                error!(pool = %self.name, "worker thread panicked during shutdown");
            }
        }
        debug!(pool = %self.name, "thread pool stopped");
    }

    fn execute(&self, job: Job) -> PoolResult<()> {
        let mut queue = self.shared.queue.lock();
        if queue.phase == Phase::Stopped {
            return Err(PoolError::Lifecycle(format!(
                "thread pool {} is stopped",
                self.name
            )));
        }
        queue.jobs.push_back(job);
        if queue.phase == Phase::Running {
            if let Err(err) = self.grow(&mut queue) {
                if queue.workers == 0 {
                    queue.jobs.pop_back();
                    return Err(err);
                }
                warn!(pool = %self.name, error = %err, "could not grow thread pool; job stays queued");
            }
        }
        drop(queue);
        self.shared.available.notify_one();
        Ok(())
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::mpsc;
    use std::time::Duration;

    #[test]
    fn clamps_bounds() {
        let pool = ThreadPool::new("t", 5, 3);
        assert_eq!((pool.min(), pool.max()), (3, 3));
        let pool = ThreadPool::new("t", 0, 0);
        assert_eq!((pool.min(), pool.max()), (0, 1));
    }

    #[test]
    fn start_spawns_min_workers() {
        let pool = ThreadPool::new("t", 2, 4);
        assert_eq!(pool.workers(), 0);
        pool.start().unwrap();
        pool.start().unwrap();
        assert_eq!(pool.workers(), 2);
        pool.stop();
        assert_eq!(pool.workers(), 0);
    }

    #[test]
    fn grows_up_to_max_under_load() {
        let pool = ThreadPool::new("t", 1, 3);
        pool.start().unwrap();

        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        let (seen_tx, seen_rx) = mpsc::channel();
        for _ in 0..6 {
            let release_rx = Arc::clone(&release_rx);
            let seen_tx = seen_tx.clone();
            pool.execute(Box::new(move |worker| {
                seen_tx.send(worker).unwrap();
                let _ = release_rx.lock().recv();
            }))
            .unwrap();
        }

        let mut workers = HashSet::new();
        for _ in 0..3 {
            workers.insert(seen_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert_eq!(workers.len(), 3);
        assert_eq!(pool.workers(), 3);

        for _ in 0..6 {
            release_tx.send(()).unwrap();
        }
        for _ in 0..3 {
            workers.insert(seen_rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
        assert!(workers.len() <= 3);
        pool.stop();
    }

    #[test]
    fn jobs_queued_before_start_run_after_start() {
        let pool = ThreadPool::new("t", 1, 1);
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move |_| tx.send(7).unwrap())).unwrap();
        assert_eq!(pool.queued(), 1);
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        pool.start().unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);
        pool.stop();
    }

    #[test]
    fn stop_drains_queue_then_rejects() {
        let pool = ThreadPool::new("t", 1, 1);
        pool.start().unwrap();
        let (tx, rx) = mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            pool.execute(Box::new(move |_| {
                thread::sleep(Duration::from_millis(5));
                tx.send(i).unwrap();
            }))
            .unwrap();
        }
        pool.stop();
        drop(tx);
        assert_eq!(rx.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4]);

        let err = pool.execute(Box::new(|_| {})).unwrap_err();
        assert!(matches!(err, PoolError::Lifecycle(_)));
        assert!(matches!(pool.start(), Err(PoolError::Lifecycle(_))));
        pool.stop();
    }

    #[test]
    fn stop_without_start_drops_jobs() {
        let pool = ThreadPool::new("t", 1, 1);
        let (tx, rx) = mpsc::channel::<()>();
        pool.execute(Box::new(move |_| drop(tx))).unwrap();
        pool.stop();
        assert_eq!(pool.queued(), 0);
        assert!(rx.recv().is_err());
    }

    #[test]
    fn panicking_job_keeps_worker_alive() {
        let pool = ThreadPool::new("t", 1, 1);
        pool.start().unwrap();
        pool.execute(Box::new(|_| panic!("boom"))).unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move |worker| tx.send(worker).unwrap()))
            .unwrap();
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            WorkerId::new(0)
        );
        assert_eq!(pool.workers(), 1);
        pool.stop();
    }

    #[test]
    fn job_sees_current_worker() {
        let pool = ThreadPool::new("t", 1, 1);
        pool.start().unwrap();
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move |worker| {
            tx.send((worker, super::super::current_worker())).unwrap()
        }))
        .unwrap();
        let (worker, current) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(current, Some(worker));
        pool.stop();
    }

    #[test]
    fn workers_are_tagged_with_their_pool() {
        let pool = ThreadPool::new("t", 1, 1);
        let other = ThreadPool::new("u", 1, 1);
        assert_ne!(pool.scope(), other.scope());
        pool.start().unwrap();

        let (mine, theirs) = (pool.scope(), other.scope());
        let (tx, rx) = mpsc::channel();
        pool.execute(Box::new(move |worker| {
            tx.send((worker, super::super::worker_in(mine), super::super::worker_in(theirs)))
                .unwrap()
        }))
        .unwrap();
        let (worker, in_mine, in_theirs) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(in_mine, Some(worker));
        assert_eq!(in_theirs, None);
        pool.stop();
    }
}
