//! Defines the `Task` handle and the machinery that drives a task body.
//!
//! A `Task` is an asynchronous computation pinned to an [`ExecutionContext`].
//! The body is an `async` block that receives a [`Cx`]; every suspension it
//! makes through [`Cx::wait`] gets the task's context installed, so whoever
//! resumes it (the timer thread, a channel peer, another task finishing)
//! hands the continuation back to that context.
//!
//! A task produces exactly one [`Outcome`]. It can be observed by blocking
//! ([`Task::blocking_result`]), by callbacks ([`Task::on_complete`],
//! [`Task::then`], [`Task::catching`], [`Task::finally`]), or by awaiting the
//! task from another task or from any other executor.
//!
//! Dropping a `Task` handle before the computation finishes detaches it: the
//! body keeps running on its context and its outcome is discarded.
use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc,
        atomic::{AtomicU8, AtomicU64, Ordering},
    },
    task::{Context, Poll},
};

use futures::{
    FutureExt,
    future::BoxFuture,
    task::{ArcWake, waker_ref},
};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::{
    awaiter::{Awaiter, Completion, IntoAwaiter, Resumer},
    context::{ContextRef, ExecutionContext, Inline},
    error::{Error, Outcome},
    timer::TimerHandle,
};

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

// Driver states. Only the thread that moved the task to `RUNNING` polls the
// body; a wake-up arriving meanwhile flips it to `NOTIFIED` and earns one
// more poll instead of being lost.
const IDLE: u8 = 0;
const RUNNING: u8 = 1;
const NOTIFIED: u8 = 2;
const COMPLETE: u8 = 3;

type Callback<T> = Box<dyn FnOnce(Outcome<T>) + Send + 'static>;

/// Process-unique identifier of a task, used in log events.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

struct Settlement<T> {
    outcome: Option<Outcome<T>>,
    callbacks: Vec<Callback<T>>,
}

// State shared by the handle, the driver, and every resumer of the task.
struct TaskState<T> {
    id: TaskId,
    name: Option<String>,
    settlement: Mutex<Settlement<T>>,
    settled: Condvar,
    body: Mutex<Option<BoxFuture<'static, Outcome<T>>>>,
    schedule: AtomicU8,
}

impl<T: Clone + Send + 'static> TaskState<T> {
    fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    // Polls the body until it completes or parks. The caller must have moved
    // `schedule` to `RUNNING`.
    fn drive(self: &Arc<Self>) {
        let waker = waker_ref(self);
        let mut cx = Context::from_waker(&*waker);
        loop {
            let (polled, finished) = {
                let mut body = self.body.lock();
                let Some(future) = body.as_mut() else {
                    return;
                };
                let polled = future.as_mut().poll(&mut cx);
                let finished = if polled.is_ready() { body.take() } else { None };
                (polled, finished)
            };
            // The finished body may own the last handle to the task's context.
            drop(finished);

            match polled {
                Poll::Ready(outcome) => {
                    self.schedule.store(COMPLETE, Ordering::Release);
                    self.complete(outcome);
                    return;
                }
                Poll::Pending => {
                    if self
                        .schedule
                        .compare_exchange(RUNNING, IDLE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                    // Woken while polling.
                    self.schedule.store(RUNNING, Ordering::Release);
                }
            }
        }
    }

    fn complete(&self, outcome: Outcome<T>) {
        let callbacks = {
            let mut settlement = self.settlement.lock();
            if settlement.outcome.is_some() {
                return;
            }
            settlement.outcome = Some(outcome.clone());
            std::mem::take(&mut settlement.callbacks)
        };
        self.settled.notify_all();

        match &outcome {
            Ok(_) => debug!(task.id = %self.id, task.name = self.name(), "task completed"),
            Err(e) => debug!(task.id = %self.id, task.name = self.name(), error = %e, "task failed"),
        }
        for callback in callbacks {
            callback(outcome.clone());
        }
    }

    fn on_complete(&self, callback: Callback<T>) {
        let mut settlement = self.settlement.lock();
        match &settlement.outcome {
            Some(outcome) => {
                let outcome = outcome.clone();
                drop(settlement);
                callback(outcome);
            }
            None => settlement.callbacks.push(callback),
        }
    }

    fn wait(&self) -> Outcome<T> {
        let mut settlement = self.settlement.lock();
        loop {
            if let Some(outcome) = &settlement.outcome {
                return outcome.clone();
            }
            self.settled.wait(&mut settlement);
        }
    }

    fn peek(&self) -> Option<Outcome<T>> {
        self.settlement.lock().outcome.clone()
    }
}

impl<T: Clone + Send + 'static> ArcWake for TaskState<T> {
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let mut current = arc_self.schedule.load(Ordering::Acquire);
        loop {
            let next = match current {
                IDLE => RUNNING,
                RUNNING => NOTIFIED,
                _ => return,
            };
            match arc_self.schedule.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) if next == RUNNING => break,
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
        arc_self.drive();
    }
}

/// Suspension interceptor handed to every task body.
///
/// [`Cx::wait`] is the only way a task body should suspend: it converts the
/// argument into an [`Awaiter`] (a [`Duration`](std::time::Duration) becomes
/// a sleep, a [`Task`] becomes a nested-task wait) and installs the task's
/// execution context into it.
#[derive(Clone)]
pub struct Cx {
    task: TaskId,
    context: ContextRef,
    timer: Option<TimerHandle>,
}

impl Cx {
    /// Prepares a suspension point for this task.
    ///
    /// # Example
    /// ```
    /// # use taskline::{Channel, Inline, Task, TimerScheduler};
    /// # use std::time::Duration;
    /// let timer = TimerScheduler::new().unwrap();
    /// let task = Task::with_timer(Inline, timer.handle(), |cx| async move {
    ///     cx.wait(Duration::from_millis(5)).await?;
    ///     let inner = Task::spawn(Inline, |_| async { Ok(20) });
    ///     let twenty = cx.wait(inner).await?;
    ///     Ok(twenty + 1)
    /// });
    /// assert_eq!(task.blocking_result().unwrap(), 21);
    /// ```
    pub fn wait<A: IntoAwaiter>(&self, suspension: A) -> Awaiter<A::Output> {
        let mut awaiter = suspension.into_awaiter(self);
        awaiter.install(Arc::clone(&self.context));
        awaiter
    }

    /// Identifier of the task this `Cx` belongs to.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task
    }

    /// The task's execution context.
    #[must_use]
    pub fn context(&self) -> &ContextRef {
        &self.context
    }

    /// The timer sleeps are scheduled on, if the task has one.
    #[must_use]
    pub fn timer(&self) -> Option<&TimerHandle> {
        self.timer.as_ref()
    }
}

impl fmt::Debug for Cx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cx")
            .field("task", &self.task)
            .field("timer", &self.timer.is_some())
            .finish_non_exhaustive()
    }
}

/// Configures and starts a [`Task`].
///
/// Without an explicit context the task runs [`Inline`]; without a timer,
/// awaiting a duration fails with [`Error::NoTimer`].
#[derive(Default)]
#[must_use]
pub struct TaskBuilder {
    context: Option<ContextRef>,
    timer: Option<TimerHandle>,
    name: Option<String>,
}

impl TaskBuilder {
    /// Sets the execution context the task starts and resumes on.
    pub fn context(mut self, context: impl ExecutionContext) -> Self {
        self.context = Some(Arc::new(context));
        self
    }

    /// Attaches the timer used for sleeps inside the task.
    pub fn timer(mut self, timer: TimerHandle) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Names the task in log events.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Starts the task.
    ///
    /// The first poll is submitted to the task's context, so `body` itself is
    /// invoked there. If the context drops that submission the task fails
    /// with [`Error::Abandoned`].
    pub fn spawn<T, F, Fut>(self, body: F) -> Task<T>
    where
        T: Clone + Send + 'static,
        F: FnOnce(Cx) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        let id = TaskId::next();
        let context = self.context.unwrap_or_else(|| Arc::new(Inline));
        let cx = Cx {
            task: id,
            context: Arc::clone(&context),
            timer: self.timer,
        };

        let body = AssertUnwindSafe(async move { body(cx).await })
            .catch_unwind()
            .map(|caught| caught.unwrap_or_else(|payload| Err(Error::from_panic(payload))))
            .boxed();

        let state = Arc::new(TaskState {
            id,
            name: self.name,
            settlement: Mutex::new(Settlement {
                outcome: None,
                callbacks: Vec::new(),
            }),
            settled: Condvar::new(),
            body: Mutex::new(Some(body)),
            schedule: AtomicU8::new(RUNNING),
        });
        trace!(task.id = %id, task.name = state.name(), "task spawned");

        let start = Start {
            state: Some(Arc::clone(&state)),
        };
        context.execute(Box::new(move || start.run()));
        Task { state }
    }
}

// First poll of a task, submitted to its context. Wake-ups arriving before it
// runs only mark the task `NOTIFIED`, since it is created `RUNNING`.
struct Start<T: Clone + Send + 'static> {
    state: Option<Arc<TaskState<T>>>,
}

impl<T: Clone + Send + 'static> Start<T> {
    fn run(mut self) {
        if let Some(state) = self.state.take() {
            state.drive();
        }
    }
}

impl<T: Clone + Send + 'static> Drop for Start<T> {
    fn drop(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        debug!(task.id = %state.id, task.name = state.name(), "context dropped task start");
        let body = state.body.lock().take();
        drop(body);
        state.schedule.store(COMPLETE, Ordering::Release);
        state.complete(Err(Error::Abandoned));
    }
}

/// Handle to an asynchronous computation producing exactly one [`Outcome`].
///
/// The handle is unique: it cannot be cloned. Observing the outcome any
/// number of times, through any combination of blocking and callbacks,
/// always yields the same result.
pub struct Task<T: Clone + Send + 'static> {
    state: Arc<TaskState<T>>,
}

impl<T: Clone + Send + 'static> Task<T> {
    /// Returns a builder for configuring a task.
    pub fn builder() -> TaskBuilder {
        TaskBuilder::default()
    }

    /// Starts `body` on `context`, without a timer.
    ///
    /// # Example
    /// ```
    /// # use taskline::{Task, WorkerQueue};
    /// let worker = WorkerQueue::new().unwrap();
    /// let task = Task::spawn(worker, |_cx| async { Ok(6 * 7) });
    /// assert_eq!(task.blocking_result().unwrap(), 42);
    /// ```
    pub fn spawn<F, Fut>(context: impl ExecutionContext, body: F) -> Self
    where
        F: FnOnce(Cx) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        Self::builder().context(context).spawn(body)
    }

    /// Starts `body` on `context`, sleeping on `timer`.
    pub fn with_timer<F, Fut>(context: impl ExecutionContext, timer: TimerHandle, body: F) -> Self
    where
        F: FnOnce(Cx) -> Fut + Send + 'static,
        Fut: Future<Output = Outcome<T>> + Send + 'static,
    {
        Self::builder().context(context).timer(timer).spawn(body)
    }

    /// Identifier of this task.
    #[must_use]
    pub fn id(&self) -> TaskId {
        self.state.id
    }

    /// Blocks the calling thread until the task finishes, then returns its outcome.
    ///
    /// Must not be called from the task's own context thread while the task
    /// still needs that thread to make progress.
    pub fn blocking_result(&self) -> Outcome<T> {
        self.state.wait()
    }

    /// Returns the outcome if the task has already finished.
    #[must_use]
    pub fn try_result(&self) -> Option<Outcome<T>> {
        self.state.peek()
    }

    /// Returns `true` once the outcome is set.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.state.settlement.lock().outcome.is_some()
    }

    /// Registers `callback` to receive the outcome.
    ///
    /// Callbacks run in registration order on whichever thread completes the
    /// task. A callback registered after completion runs immediately, before
    /// this method returns.
    pub fn on_complete(&self, callback: impl FnOnce(Outcome<T>) + Send + 'static) -> &Self {
        self.state.on_complete(Box::new(callback));
        self
    }

    /// Runs `handler` with the value if the task succeeds.
    ///
    /// A panic inside `handler` is caught and logged, never propagated.
    pub fn then(&self, handler: impl FnOnce(T) + Send + 'static) -> &Self {
        let id = self.state.id;
        self.on_complete(move |outcome| {
            if let Ok(value) = outcome {
                guard_handler(id, "then", move || handler(value));
            }
        })
    }

    /// Runs `handler` with the failure if the task fails.
    ///
    /// A panic inside `handler` is caught and logged, never propagated.
    pub fn catching(&self, handler: impl FnOnce(Error) + Send + 'static) -> &Self {
        let id = self.state.id;
        self.on_complete(move |outcome| {
            if let Err(error) = outcome {
                guard_handler(id, "catching", move || handler(error));
            }
        })
    }

    /// Runs `handler` once the task finishes, whatever the outcome.
    ///
    /// A panic inside `handler` is caught and logged, never propagated.
    pub fn finally(&self, handler: impl FnOnce() + Send + 'static) -> &Self {
        let id = self.state.id;
        self.on_complete(move |_| guard_handler(id, "finally", handler))
    }
}

fn guard_handler(task: TaskId, kind: &'static str, handler: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(handler)).is_err() {
        warn!(task.id = %task, handler = kind, "completion handler panicked");
    }
}

impl<T: Clone + Send + 'static> Completion<T> for Task<T> {
    fn subscribe(&self, resumer: Resumer<T>) {
        self.state
            .on_complete(Box::new(move |outcome| resumer.resume(outcome)));
    }
}

impl<T: Clone + Send + 'static> IntoAwaiter for Task<T> {
    type Output = T;

    fn into_awaiter(self, _cx: &Cx) -> Awaiter<T> {
        Awaiter::nested(Box::new(self))
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Task<T> {
    type Output = Outcome<T>;
    type IntoFuture = Awaiter<T>;

    fn into_future(self) -> Awaiter<T> {
        Awaiter::nested(Box::new(self))
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.state.id)
            .field("name", &self.state.name)
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl<T: Clone + Send + 'static> Drop for Task<T> {
    fn drop(&mut self) {
        if !self.is_finished() {
            debug!(
                task.id = %self.state.id,
                task.name = self.state.name(),
                "task handle dropped before completion, task detached"
            );
        }
    }
}
