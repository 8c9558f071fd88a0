//! A deadline-ordered timer backed by one dedicated thread.
//!
//! [`TimerScheduler`] owns a worker that sleeps until the earliest pending
//! deadline and then runs that callable inline. Submissions go through the
//! scheduler itself or through any number of cloned [`TimerHandle`]s.
//!
//! Callables run on the timer thread, so they should be short: sleep
//! awaiters only use it to hand the resumption over to an execution context.

use std::{
    cmp::Ordering,
    collections::BinaryHeap,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    thread::{self, JoinHandle, ThreadId},
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::{context::Job, error::Error};

// Deadline used when `now + delay` does not fit in an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

// A callable waiting for its instant. The heap is a max-heap, so ordering is
// reversed: the earliest deadline (then the lowest sequence) sits on top.
struct DelayedCallable {
    deadline: Instant,
    seq: u64,
    job: Job,
}

impl PartialEq for DelayedCallable {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for DelayedCallable {}

impl Ord for DelayedCallable {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for DelayedCallable {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct TimerQueue {
    heap: BinaryHeap<DelayedCallable>,
    next_seq: u64,
    active: bool,
}

struct TimerShared {
    queue: Mutex<TimerQueue>,
    changed: Condvar,
}

impl TimerShared {
    fn submit(&self, job: Job, delay: Duration) -> Result<(), Error> {
        let now = Instant::now();
        let deadline = now
            .checked_add(delay)
            .unwrap_or_else(|| now + FAR_FUTURE);
        let mut queue = self.queue.lock();
        if !queue.active {
            trace!("timer is shut down, callable rejected");
            return Err(Error::TimerShutdown);
        }
        let earliest = queue.heap.peek().is_none_or(|top| deadline < top.deadline);
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(DelayedCallable { deadline, seq, job });
        drop(queue);

        if earliest {
            self.changed.notify_one();
        }
        Ok(())
    }

    fn run_loop(&self) {
        loop {
            let due = {
                let mut queue = self.queue.lock();
                loop {
                    let Some(top) = queue.heap.peek() else {
                        if !queue.active {
                            return;
                        }
                        self.changed.wait(&mut queue);
                        continue;
                    };
                    let deadline = top.deadline;
                    if deadline <= Instant::now() {
                        break queue.heap.pop();
                    }
                    // Woken early either by an earlier submission or by shutdown;
                    // both are handled by peeking again.
                    let _ = self.changed.wait_until(&mut queue, deadline);
                }
            };
            if let Some(entry) = due {
                trace!(seq = entry.seq, "timer fired");
                if panic::catch_unwind(AssertUnwindSafe(entry.job)).is_err() {
                    warn!(seq = entry.seq, "timer callable panicked");
                }
            }
        }
    }
}

/// Cloneable submission handle to a [`TimerScheduler`].
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    /// Runs `job` on the timer thread no earlier than `delay` from now.
    ///
    /// A delay too large to add to the current instant is clamped to a
    /// deadline about a century away.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerShutdown`] once the scheduler has been shut down; the
    /// job is dropped without running.
    pub fn execute(
        &self,
        job: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> Result<(), Error> {
        self.shared.submit(Box::new(job), delay)
    }

    /// Number of callables still waiting for their deadline.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.shared.queue.lock().heap.len()
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("pending", &self.pending())
            .finish()
    }
}

/// Builder for a [`TimerScheduler`].
#[derive(Debug, Default)]
#[must_use]
pub struct TimerSchedulerBuilder {
    thread_name: Option<String>,
}

impl TimerSchedulerBuilder {
    /// Names the timer thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = Some(name.into());
        self
    }

    /// Starts the timer thread.
    pub fn build(self) -> Result<TimerScheduler, Error> {
        let shared = Arc::new(TimerShared {
            queue: Mutex::new(TimerQueue {
                heap: BinaryHeap::with_capacity(16),
                next_seq: 0,
                active: true,
            }),
            changed: Condvar::new(),
        });
        let worker = Arc::clone(&shared);
        let name = self
            .thread_name
            .unwrap_or_else(|| "taskline-timer".to_string());
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || worker.run_loop())?;
        debug!(timer = %name, "timer scheduler started");
        Ok(TimerScheduler {
            shared,
            worker_id: handle.thread().id(),
            handle: Mutex::new(Some(handle)),
        })
    }
}

/// Invokes callables at requested instants, in deadline order, on its own thread.
///
/// The scheduler is owned explicitly: create one, hand out [`TimerHandle`]s to
/// the tasks that sleep, and drop it (or call [`shutdown`](Self::shutdown) and
/// [`join`](Self::join)) when done. Dropping discards pending callables.
///
/// # Example
/// ```
/// # use taskline::TimerScheduler;
/// # use std::{sync::mpsc, time::Duration};
/// let timer = TimerScheduler::new().unwrap();
/// let (tx, rx) = mpsc::channel();
/// timer.execute(move || tx.send("fired").unwrap(), Duration::from_millis(10)).unwrap();
/// assert_eq!(rx.recv().unwrap(), "fired");
/// ```
pub struct TimerScheduler {
    shared: Arc<TimerShared>,
    worker_id: ThreadId,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl TimerScheduler {
    /// Starts a timer with default settings.
    pub fn new() -> Result<Self, Error> {
        Self::builder().build()
    }

    /// Returns a builder for configuring the timer.
    pub fn builder() -> TimerSchedulerBuilder {
        TimerSchedulerBuilder::default()
    }

    /// Returns a handle for submitting callables from elsewhere.
    #[must_use]
    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Runs `job` on the timer thread no earlier than `delay` from now.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TimerShutdown`] once the scheduler has been shut down.
    pub fn execute(
        &self,
        job: impl FnOnce() + Send + 'static,
        delay: Duration,
    ) -> Result<(), Error> {
        self.shared.submit(Box::new(job), delay)
    }

    /// Stops accepting callables.
    ///
    /// With `wait_for_pending` the worker keeps firing what is already queued,
    /// each at its deadline, and exits once the heap is empty. Without it the
    /// pending callables are dropped unrun.
    pub fn shutdown(&self, wait_for_pending: bool) {
        let discarded = {
            let mut queue = self.shared.queue.lock();
            queue.active = false;
            if wait_for_pending {
                BinaryHeap::new()
            } else {
                std::mem::take(&mut queue.heap)
            }
        };
        self.shared.changed.notify_all();
        if !discarded.is_empty() {
            debug!(discarded = discarded.len(), "timer shut down, pending callables discarded");
        }
        // Dropped outside the lock: discarded jobs may run arbitrary drop code.
        drop(discarded);
    }

    /// Waits for the timer thread to exit.
    ///
    /// Returns immediately when called from a callable running on the timer thread.
    pub fn join(&self) {
        if thread::current().id() == self.worker_id {
            return;
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                warn!("timer thread panicked");
            }
        }
    }
}

impl fmt::Debug for TimerScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queue = self.shared.queue.lock();
        f.debug_struct("TimerScheduler")
            .field("active", &queue.active)
            .field("pending", &queue.heap.len())
            .finish()
    }
}

impl Drop for TimerScheduler {
    fn drop(&mut self) {
        self.shutdown(false);
        self.join();
    }
}
