//! Executor that runs jobs on the submitting thread.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::debug;

use super::{Executor, Job, ScopeId, WorkerId, run_as};
use crate::error::{PoolError, PoolResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Stopped,
}

struct State {
    phase: Phase,
    pending: VecDeque<Job>,
    next: usize,
}

/// Runs every job synchronously inside [`execute`](Executor::execute).
///
/// Jobs are assigned to a fixed set of simulated workers in round-robin order,
/// so worker affinity can be exercised deterministically without OS threads.
/// Jobs submitted before `start` are held and run, in order, when it is called.
///
/// Futures returned by the pool are already resolved when the submitting call
/// returns.
pub struct InlineExecutor {
    scope: ScopeId,
    workers: usize,
    state: Mutex<State>,
}

impl InlineExecutor {
    /// A single simulated worker.
    pub fn new() -> Self {
        Self::with_workers(1)
    }

    /// `workers` simulated workers, used round-robin. At least one.
    pub fn with_workers(workers: usize) -> Self {
        Self {
            scope: ScopeId::next(),
            workers: workers.max(1),
            state: Mutex::new(State {
                phase: Phase::Idle,
                pending: VecDeque::new(),
                next: 0,
            }),
        }
    }

    /// Scope tagging this executor's simulated workers.
    pub fn scope(&self) -> ScopeId {
        self.scope
    }

    fn next_worker(state: &mut State, workers: usize) -> WorkerId {
        let worker = WorkerId::new(state.next % workers);
        state.next += 1;
        worker
    }
}

impl Default for InlineExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl Executor for InlineExecutor {
    fn start(&self) -> PoolResult<()> {
        let pending = {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Running => return Ok(()),
                Phase::Stopped => {
                    return Err(PoolError::Lifecycle(
                        "inline executor cannot be restarted".into(),
                    ));
                }
                Phase::Idle => {}
            }
            state.phase = Phase::Running;
            std::mem::take(&mut state.pending)
        };
        debug!(queued = pending.len(), "starting inline executor");
        for job in pending {
            let worker = Self::next_worker(&mut self.state.lock(), self.workers);
            run_as(self.scope, worker, || job(worker));
        }
        Ok(())
    }

    fn stop(&self) {
        let mut state = self.state.lock();
        state.phase = Phase::Stopped;
        state.pending.clear();
    }

    fn execute(&self, job: Job) -> PoolResult<()> {
        let worker = {
            let mut state = self.state.lock();
            match state.phase {
                Phase::Stopped => {
                    return Err(PoolError::Lifecycle("inline executor is stopped".into()));
                }
                Phase::Idle => {
                    state.pending.push_back(job);
                    return Ok(());
                }
                Phase::Running => Self::next_worker(&mut state, self.workers),
            }
        };
        run_as(self.scope, worker, || job(worker));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn recorder(log: &Arc<Mutex<Vec<(usize, WorkerId)>>>, tag: usize) -> Job {
        let log = Arc::clone(log);
        Box::new(move |worker| log.lock().push((tag, worker)))
    }

    #[test]
    fn round_robin_over_workers() {
        let exec = InlineExecutor::with_workers(2);
        exec.start().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for tag in 0..4 {
            exec.execute(recorder(&log, tag)).unwrap();
        }
        let workers: Vec<usize> = log.lock().iter().map(|(_, w)| w.index()).collect();
        assert_eq!(workers, vec![0, 1, 0, 1]);
    }

    #[test]
    fn holds_jobs_until_started() {
        let exec = InlineExecutor::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        exec.execute(recorder(&log, 1)).unwrap();
        exec.execute(recorder(&log, 2)).unwrap();
        assert!(log.lock().is_empty());
        exec.start().unwrap();
        let tags: Vec<usize> = log.lock().iter().map(|(t, _)| *t).collect();
        assert_eq!(tags, vec![1, 2]);
    }

    #[test]
    fn rejects_after_stop() {
        let exec = InlineExecutor::new();
        exec.start().unwrap();
        exec.stop();
        exec.stop();
        assert!(matches!(exec.execute(Box::new(|_| {})), Err(PoolError::Lifecycle(_))));
        assert!(matches!(exec.start(), Err(PoolError::Lifecycle(_))));
    }

    #[test]
    fn jobs_run_inside_the_executor_scope() {
        let exec = InlineExecutor::with_workers(2);
        let other = InlineExecutor::new();
        exec.start().unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..2 {
            let log = Arc::clone(&log);
            let (mine, theirs) = (exec.scope(), other.scope());
            exec.execute(Box::new(move |worker| {
                log.lock().push((
                    worker,
                    super::super::worker_in(mine),
                    super::super::worker_in(theirs),
                ))
            }))
            .unwrap();
        }
        for (worker, in_mine, in_theirs) in log.lock().iter() {
            assert_eq!(*in_mine, Some(*worker));
            assert_eq!(*in_theirs, None);
        }
        assert_eq!(super::super::worker_in(exec.scope()), None);
    }
}
