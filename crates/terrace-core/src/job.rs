//! # Job Runtime
//!
//! Completion handles and the data-parallel runtime nodes schedule work on.
//!
//! A `JobHandle` is an opaque token for in-flight work. The walk only ever
//! polls `is_completed()`; it never waits. Ordering between jobs is enforced
//! here: `JobRuntime::schedule` queues work behind its dependency handle, so
//! a job starts only after everything it depends on has finished.
//!
//! Two backends exist:
//! - `Pool`: a rayon thread pool, the normal runtime.
//! - `Inline`: work runs on whichever thread completes its dependency. Used
//!   for deterministic tests and previews where worker threads are unwanted.

use crate::FlowError;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

type Continuation = Box<dyn FnOnce() + Send>;

// =============================================================================
// SHARED COMPLETION STATE
// =============================================================================

#[derive(Default)]
struct JobState {
    done: AtomicBool,
    continuations: Mutex<Vec<Continuation>>,
    finished: Condvar,
}

impl JobState {
    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    /// Mark complete and run every queued continuation exactly once.
    fn complete(&self) {
        let pending = {
            let mut queued = self
                .continuations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.done.swap(true, Ordering::AcqRel) {
                return;
            }
            std::mem::take(&mut *queued)
        };
        self.finished.notify_all();
        for continuation in pending {
            continuation();
        }
    }

    fn on_complete(&self, continuation: Continuation) {
        {
            let mut queued = self
                .continuations
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if !self.is_done() {
                queued.push(continuation);
                return;
            }
        }
        continuation();
    }

    fn wait(&self) {
        let mut queued = self
            .continuations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !self.is_done() {
            queued = self
                .finished
                .wait(queued)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let queued = self
            .continuations
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let (_queued, _) = self
            .finished
            .wait_timeout_while(queued, timeout, |_| !self.is_done())
            .unwrap_or_else(PoisonError::into_inner);
        self.is_done()
    }
}

// =============================================================================
// JOB HANDLE
// =============================================================================

/// Completion token for scheduled work.
///
/// Cloning is cheap; every clone observes the same completion.
#[derive(Clone, Default)]
pub struct JobHandle {
    state: Option<Arc<JobState>>,
}

impl JobHandle {
    /// A handle that is already complete.
    #[must_use]
    pub fn completed() -> Self {
        Self { state: None }
    }

    /// Non-blocking completion check.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        self.state.as_ref().is_none_or(|state| state.is_done())
    }

    /// Run `f` once this handle completes.
    ///
    /// Runs immediately on the calling thread if the handle is already
    /// complete; otherwise on the thread that completes it.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        match &self.state {
            Some(state) => state.on_complete(Box::new(f)),
            None => f(),
        }
    }

    /// Block the calling thread until the handle completes.
    ///
    /// Only for teardown and tools. The walk never calls this.
    pub fn wait(&self) {
        if let Some(state) = &self.state {
            state.wait();
        }
    }

    /// Block for at most `timeout`. Returns whether the handle completed.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match &self.state {
            Some(state) => state.wait_timeout(timeout),
            None => true,
        }
    }

    /// Compose several handles into one that completes after all of them.
    ///
    /// Already-complete handles are skipped; an empty or fully complete
    /// input yields a completed handle.
    #[must_use]
    pub fn combine(handles: &[JobHandle]) -> JobHandle {
        let pending: Vec<&Arc<JobState>> = handles
            .iter()
            .filter_map(|handle| handle.state.as_ref())
            .filter(|state| !state.is_done())
            .collect();

        match pending.as_slice() {
            [] => Self::completed(),
            [only] => Self {
                state: Some(Arc::clone(*only)),
            },
            many => {
                let combined = Arc::new(JobState::default());
                let remaining = Arc::new(AtomicUsize::new(many.len()));
                for state in many {
                    let combined = Arc::clone(&combined);
                    let remaining = Arc::clone(&remaining);
                    state.on_complete(Box::new(move || {
                        if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                            combined.complete();
                        }
                    }));
                }
                Self {
                    state: Some(combined),
                }
            }
        }
    }
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("completed", &self.is_completed())
            .finish()
    }
}

// =============================================================================
// JOB TRIGGER
// =============================================================================

/// Producer side of a pending `JobHandle`.
///
/// Dropping a trigger without calling `complete` leaves its handle pending
/// forever, which is how a stalled job looks to the walk.
pub struct JobTrigger {
    state: Arc<JobState>,
}

impl JobTrigger {
    /// Create a pending handle and the trigger that completes it.
    #[must_use]
    pub fn pending() -> (JobTrigger, JobHandle) {
        let state = Arc::new(JobState::default());
        let handle = JobHandle {
            state: Some(Arc::clone(&state)),
        };
        (JobTrigger { state }, handle)
    }

    /// Another handle observing this trigger.
    #[must_use]
    pub fn handle(&self) -> JobHandle {
        JobHandle {
            state: Some(Arc::clone(&self.state)),
        }
    }

    /// Complete the handle and run its continuations.
    pub fn complete(self) {
        self.state.complete();
    }
}

impl fmt::Debug for JobTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobTrigger")
            .field("completed", &self.state.is_done())
            .finish()
    }
}

// =============================================================================
// JOB RUNTIME
// =============================================================================

#[derive(Clone)]
enum Backend {
    Pool(Arc<ThreadPool>),
    Inline,
}

/// Data-parallel runtime that nodes schedule their work on.
#[derive(Clone)]
pub struct JobRuntime {
    backend: Backend,
    scheduled: Arc<AtomicU64>,
}

impl JobRuntime {
    /// Start a runtime with `workers` threads. Zero workers gives the
    /// inline runtime.
    pub fn new(workers: usize) -> Result<Self, FlowError> {
        if workers == 0 {
            return Ok(Self::inline());
        }

        let pool = ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|index| format!("terrace-worker-{index}"))
            .panic_handler(|_| {
                tracing::error!("job panicked; its handle will never complete");
            })
            .build()
            .map_err(|e| FlowError::RuntimeBuild(e.to_string()))?;

        tracing::debug!(workers, "job runtime started");
        Ok(Self {
            backend: Backend::Pool(Arc::new(pool)),
            scheduled: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Runtime that runs work on the thread completing its dependency.
    #[must_use]
    pub fn inline() -> Self {
        Self {
            backend: Backend::Inline,
            scheduled: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Whether this is the inline runtime.
    #[must_use]
    pub fn is_inline(&self) -> bool {
        matches!(self.backend, Backend::Inline)
    }

    /// Number of worker threads (0 for inline).
    #[must_use]
    pub fn workers(&self) -> usize {
        match &self.backend {
            Backend::Pool(pool) => pool.current_num_threads(),
            Backend::Inline => 0,
        }
    }

    /// Total jobs scheduled through this runtime.
    #[must_use]
    pub fn scheduled(&self) -> u64 {
        self.scheduled.load(Ordering::Relaxed)
    }

    /// Queue `work` to run once `dependency` completes.
    ///
    /// Returns immediately with the handle of the new job.
    pub fn schedule<F>(&self, dependency: &JobHandle, work: F) -> JobHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let (trigger, handle) = JobTrigger::pending();
        self.scheduled.fetch_add(1, Ordering::Relaxed);

        match &self.backend {
            Backend::Pool(pool) => {
                let pool = Arc::clone(pool);
                dependency.on_complete(move || {
                    pool.spawn(move || {
                        work();
                        trigger.complete();
                    });
                });
            }
            Backend::Inline => dependency.on_complete(move || {
                work();
                trigger.complete();
            }),
        }

        handle
    }

    /// Split work into `count` jobs behind the same dependency.
    ///
    /// `work` receives the batch index. The returned handle completes once
    /// every batch has.
    pub fn schedule_batch<F>(&self, dependency: &JobHandle, count: usize, work: F) -> JobHandle
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        let work = Arc::new(work);
        let handles: Vec<JobHandle> = (0..count)
            .map(|index| {
                let work = Arc::clone(&work);
                self.schedule(dependency, move || work(index))
            })
            .collect();
        JobHandle::combine(&handles)
    }
}

impl fmt::Debug for JobRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobRuntime")
            .field("inline", &self.is_inline())
            .field("workers", &self.workers())
            .field("scheduled", &self.scheduled())
            .finish()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_handle_is_complete() {
        assert!(JobHandle::completed().is_completed());
        assert!(JobHandle::default().is_completed());
    }

    #[test]
    fn trigger_completes_handle_and_runs_continuation_once() {
        let (trigger, handle) = JobTrigger::pending();
        let runs = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&runs);
        handle.on_complete(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!handle.is_completed());
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        trigger.complete();
        assert!(handle.is_completed());
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn continuation_on_completed_handle_runs_immediately() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        JobHandle::completed().on_complete(move || flag.store(true, Ordering::SeqCst));
        assert!(ran.load(Ordering::SeqCst));
    }

    #[test]
    fn combine_waits_for_every_input() {
        let (first, a) = JobTrigger::pending();
        let (second, b) = JobTrigger::pending();
        let combined = JobHandle::combine(&[a, JobHandle::completed(), b]);

        assert!(!combined.is_completed());
        first.complete();
        assert!(!combined.is_completed());
        second.complete();
        assert!(combined.is_completed());
    }

    #[test]
    fn combine_of_nothing_is_complete() {
        assert!(JobHandle::combine(&[]).is_completed());
        assert!(JobHandle::combine(&[JobHandle::completed()]).is_completed());
    }

    #[test]
    fn inline_schedule_waits_for_dependency() {
        let runtime = JobRuntime::inline();
        let (trigger, dependency) = JobTrigger::pending();
        let ran = Arc::new(AtomicBool::new(false));

        let flag = Arc::clone(&ran);
        let job = runtime.schedule(&dependency, move || flag.store(true, Ordering::SeqCst));
        assert!(!job.is_completed());
        assert!(!ran.load(Ordering::SeqCst));

        trigger.complete();
        assert!(job.is_completed());
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(runtime.scheduled(), 1);
    }

    #[test]
    fn wait_timeout_gives_up_on_stalled_handle() {
        let (trigger, handle) = JobTrigger::pending();
        assert!(!handle.wait_timeout(Duration::from_millis(10)));

        trigger.complete();
        assert!(handle.wait_timeout(Duration::from_millis(10)));
        assert!(JobHandle::completed().wait_timeout(Duration::ZERO));
    }

    #[test]
    fn pool_runtime_runs_batches() {
        let runtime = JobRuntime::new(2).expect("runtime");
        let sum = Arc::new(AtomicUsize::new(0));

        let total = Arc::clone(&sum);
        let job = runtime.schedule_batch(&JobHandle::completed(), 10, move |index| {
            total.fetch_add(index, Ordering::SeqCst);
        });
        job.wait();

        assert!(job.is_completed());
        assert_eq!(sum.load(Ordering::SeqCst), 45);
        assert_eq!(runtime.workers(), 2);
    }

    #[test]
    fn zero_workers_gives_inline_runtime() {
        let runtime = JobRuntime::new(0).expect("runtime");
        assert!(runtime.is_inline());
        assert_eq!(runtime.workers(), 0);
    }
}
