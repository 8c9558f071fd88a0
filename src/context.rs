//! Execution contexts: the places where task bodies start and resume.
//!
//! An [`ExecutionContext`] only knows how to run a submitted job. Four
//! reference policies are provided:
//!
//! - [`Inline`] runs the job immediately on the submitting call stack.
//! - [`DetachedThread`] spawns a fresh OS thread per job and forgets it.
//! - [`PoolSubmit`] hands the job to a `futures` thread pool.
//! - [`WorkerQueue`] owns one worker thread draining a FIFO queue.
//!
//! Every resumption of a task is funneled through the context the task owns,
//! so the policy chosen here decides which thread runs the task body.

use std::{
    collections::VecDeque,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle, ThreadId},
};

use futures::executor::{ThreadPool, ThreadPoolBuilder};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::error::Error;

/// A unit of work submitted to an execution context.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Shared, type-erased execution context as stored by tasks and awaiters.
pub type ContextRef = Arc<dyn ExecutionContext>;

/// Capability to run a submitted job according to some threading policy.
pub trait ExecutionContext: Send + Sync + 'static {
    /// Runs `job` at some point, on whichever thread the policy selects.
    fn execute(&self, job: Job);
}

impl<E: ExecutionContext + ?Sized> ExecutionContext for Arc<E> {
    fn execute(&self, job: Job) {
        (**self).execute(job);
    }
}

impl<E: ExecutionContext + ?Sized> ExecutionContext for Box<E> {
    fn execute(&self, job: Job) {
        (**self).execute(job);
    }
}

/// Runs every job right away, on the caller's stack.
#[derive(Clone, Copy, Debug, Default)]
pub struct Inline;

impl ExecutionContext for Inline {
    fn execute(&self, job: Job) {
        job();
    }
}

/// Spawns a new detached OS thread for every job.
#[derive(Clone, Debug, Default)]
pub struct DetachedThread {
    name_prefix: Option<String>,
    spawned: Arc<AtomicUsize>,
}

impl DetachedThread {
    /// Creates a context whose threads are unnamed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a context naming its threads `{prefix}-{n}`.
    #[must_use]
    pub fn named(prefix: impl Into<String>) -> Self {
        Self {
            name_prefix: Some(prefix.into()),
            spawned: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl ExecutionContext for DetachedThread {
    fn execute(&self, job: Job) {
        let n = self.spawned.fetch_add(1, Ordering::Relaxed);
        let mut builder = thread::Builder::new();
        if let Some(prefix) = &self.name_prefix {
            builder = builder.name(format!("{prefix}-{n}"));
        }
        if let Err(e) = builder.spawn(job) {
            warn!(error = %e, "detached thread could not be spawned, job dropped");
        }
    }
}

/// Fire-and-forget submission to a `futures` thread pool.
#[derive(Clone)]
pub struct PoolSubmit {
    pool: ThreadPool,
}

impl PoolSubmit {
    /// Creates a dedicated pool with `pool_size` threads.
    pub fn new(pool_size: usize) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new().pool_size(pool_size).create()?;
        Ok(Self { pool })
    }

    /// Creates a dedicated pool whose threads are named `{prefix}{n}`.
    pub fn with_name_prefix(pool_size: usize, prefix: impl Into<String>) -> Result<Self, Error> {
        let pool = ThreadPoolBuilder::new()
            .pool_size(pool_size)
            .name_prefix(prefix)
            .create()?;
        Ok(Self { pool })
    }

    /// Submits to an existing pool.
    #[must_use]
    pub fn from_pool(pool: ThreadPool) -> Self {
        Self { pool }
    }
}

impl fmt::Debug for PoolSubmit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolSubmit").finish_non_exhaustive()
    }
}

impl ExecutionContext for PoolSubmit {
    fn execute(&self, job: Job) {
        self.pool.spawn_ok(async move { job() });
    }
}

struct WorkerState {
    queue: VecDeque<Job>,
    active: bool,
}

struct WorkerShared {
    state: Mutex<WorkerState>,
    available: Condvar,
}

impl WorkerShared {
    fn run_loop(&self) {
        loop {
            let job = {
                let mut state = self.state.lock();
                loop {
                    if let Some(job) = state.queue.pop_front() {
                        break job;
                    }
                    if !state.active {
                        return;
                    }
                    self.available.wait(&mut state);
                }
            };
            if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                warn!("worker queue job panicked");
            }
        }
    }
}

/// Builder for a [`WorkerQueue`].
#[derive(Debug, Default)]
#[must_use]
pub struct WorkerQueueBuilder {
    thread_name: Option<String>,
}

impl WorkerQueueBuilder {
    /// Names the worker thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Starts the worker thread.
    pub fn build(self) -> Result<WorkerQueue, Error> {
        let shared = Arc::new(WorkerShared {
            state: Mutex::new(WorkerState {
                queue: VecDeque::with_capacity(16),
                active: true,
            }),
            available: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let name = self
            .thread_name
            .unwrap_or_else(|| "taskline-worker".to_string());
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run_loop())?;
        debug!(worker = %name, "worker queue started");
        Ok(WorkerQueue {
            shared,
            worker_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }
}

/// One persistent worker thread draining a FIFO job queue.
///
/// Jobs run strictly in submission order. Shutting the queue down stops it
/// from accepting work, lets the worker finish what is already queued, and
/// then stops the thread.
pub struct WorkerQueue {
    shared: Arc<WorkerShared>,
    worker_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerQueue {
    /// Starts a worker with default settings.
    pub fn new() -> Result<Self, Error> {
        Self::builder().build()
    }

    /// Returns a builder for configuring the worker.
    pub fn builder() -> WorkerQueueBuilder {
        WorkerQueueBuilder::default()
    }

    /// Stops accepting work; already queued jobs still run.
    pub fn shutdown(&self) {
        let mut state = self.shared.state.lock();
        if state.active {
            state.active = false;
            debug!(pending = state.queue.len(), "worker queue shutting down");
        }
        drop(state);
        self.shared.available.notify_all();
    }

    /// Waits for the worker thread to exit.
    ///
    /// Returns immediately when called from the worker itself.
    pub fn join(&self) {
        if thread::current().id() == self.worker_id {
            return;
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("worker queue thread panicked");
            }
        }
    }

    /// Returns `true` until [`shutdown`](Self::shutdown) is called.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.state.lock().active
    }
}

impl fmt::Debug for WorkerQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkerQueue")
            .field("active", &state.active)
            .field("pending", &state.queue.len())
            .finish()
    }
}

impl ExecutionContext for WorkerQueue {
    fn execute(&self, job: Job) {
        let mut state = self.shared.state.lock();
        if !state.active {
            trace!("worker queue is shut down, job dropped");
            return;
        }
        state.queue.push_back(job);
        drop(state);
        self.shared.available.notify_one();
    }
}

impl Drop for WorkerQueue {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}
