//! The suspend/resume protocol shared by every suspension point.
//!
//! An [`Awaiter`] is a future with two hooks. The *suspend hook* runs once,
//! on the first poll, and hands a one-shot resumer to whichever party will
//! complete the suspension. The *resume hook* runs on the poll that finds
//! the result slot filled, and turns the stored outcome into the value of the
//! `.await` expression.
//!
//! The kinds of suspension are a closed set: context dispatch, timed sleep,
//! a nested [`Task`], an external blocking producer, and the two channel
//! operations.
//!
//! Resumption is always delivered through the execution context installed in
//! the awaiter. Inside a task that is the task's own context (installed by
//! [`Cx::wait`]); an awaiter polled by a foreign executor has no installed
//! context and is resumed inline on the resuming thread.
//!
//! [`Task`]: crate::Task
//! [`Cx::wait`]: crate::Cx::wait

use std::{
    fmt,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
    thread,
    time::Duration,
};

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::{
    channel::{ChannelParty, ReadParty},
    context::ContextRef,
    error::{Error, Outcome},
    task::Cx,
    timer::TimerHandle,
};

// Single-slot outcome holder plus the parked continuation.
struct Slot<T> {
    outcome: Option<Outcome<T>>,
    waker: Option<Waker>,
    // Set when the awaiter is dropped before being resumed. A detached slot
    // swallows late resumptions instead of waking a torn-down continuation.
    detached: bool,
}

type SharedSlot<T> = Arc<Mutex<Slot<T>>>;

/// One-shot capability to resume a suspended awaiter.
///
/// Handed to whichever party completes the suspension (a timer callable, a
/// channel peer, an inner task's completion callback, a bridge thread).
/// Dropping a resumer without calling [`resume`](Self::resume) resumes the
/// awaiter with [`Error::Abandoned`], so a discarded wake-up never leaves a
/// task hanging.
pub(crate) struct Resumer<T: Send + 'static> {
    slot: Option<SharedSlot<T>>,
    installed: Option<ContextRef>,
}

impl<T: Send + 'static> Resumer<T> {
    pub(crate) fn resume(mut self, outcome: Outcome<T>) {
        if let Some(slot) = self.slot.take() {
            deliver(slot, self.installed.take(), outcome);
        }
    }

    // Disarms a resumer that will never be used, without resuming anyone.
    fn forget(mut self) {
        self.slot = None;
    }
}

impl<T: Send + 'static> Drop for Resumer<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            deliver(slot, self.installed.take(), Err(Error::Abandoned));
        }
    }
}

fn deliver<T: Send + 'static>(
    slot: SharedSlot<T>,
    installed: Option<ContextRef>,
    outcome: Outcome<T>,
) {
    if slot.lock().detached {
        return;
    }
    let delivery = Delivery {
        slot,
        outcome: Some(outcome),
    };
    match installed {
        Some(context) => context.execute(Box::new(move || delivery.run())),
        None => delivery.run(),
    }
}

// An outcome on its way into a slot. A context that drops it unrun still
// resumes the awaiter, with `Error::Abandoned`, on the dropping thread.
struct Delivery<T: Send + 'static> {
    slot: SharedSlot<T>,
    outcome: Option<Outcome<T>>,
}

impl<T: Send + 'static> Delivery<T> {
    fn run(mut self) {
        if let Some(outcome) = self.outcome.take() {
            fill(&self.slot, outcome);
        }
    }
}

impl<T: Send + 'static> Drop for Delivery<T> {
    fn drop(&mut self) {
        if self.outcome.take().is_some() {
            fill(&self.slot, Err(Error::Abandoned));
        }
    }
}

fn fill<T>(slot: &SharedSlot<T>, outcome: Outcome<T>) {
    let waker = {
        let mut slot = slot.lock();
        if slot.detached {
            return;
        }
        slot.outcome = Some(outcome);
        slot.waker.take()
    };
    if let Some(waker) = waker {
        waker.wake();
    }
}

type Producer<T> = Box<dyn FnOnce() -> Outcome<T> + Send + 'static>;

/// Something that reports a single outcome to subscribed resumers.
pub(crate) trait Completion<T: Send + 'static>: Send {
    fn subscribe(&self, resumer: Resumer<T>);
}

/// The closed set of suspension kinds, each with its own suspend and resume behavior.
pub(crate) enum AwaiterKind<T: Send + 'static> {
    /// Already resolved; never suspends.
    Ready,
    /// Resumes immediately through the target context.
    Dispatch { unit: fn() -> T },
    /// Resumes once the timer fires.
    Sleep {
        timer: TimerHandle,
        delay: Duration,
        unit: fn() -> T,
    },
    /// Resumes with the outcome of an inner task.
    NestedTask(Box<dyn Completion<T>>),
    /// Resumes with the value computed by a blocking producer on a fresh thread.
    ExternalFuture(Option<Producer<T>>),
    /// Resumes with a value handed over by a channel writer.
    ChannelRead(ReadParty<T>),
    /// Resumes once a channel reader or buffer slot took the written value.
    ChannelWrite(Box<dyn ChannelParty<T>>),
}

impl<T: Send + 'static> AwaiterKind<T> {
    fn name(&self) -> &'static str {
        match self {
            AwaiterKind::Ready => "ready",
            AwaiterKind::Dispatch { .. } => "dispatch",
            AwaiterKind::Sleep { .. } => "sleep",
            AwaiterKind::NestedTask(_) => "nested_task",
            AwaiterKind::ExternalFuture(_) => "external_future",
            AwaiterKind::ChannelRead(_) => "channel_read",
            AwaiterKind::ChannelWrite(_) => "channel_write",
        }
    }
}

/// A single suspension point.
///
/// Awaiters are created by [`Cx::wait`](crate::Cx::wait), by the channel
/// operations, or directly through the constructors below. They resolve to an
/// [`Outcome`] exactly once.
#[must_use = "awaiters do nothing unless polled or .awaited"]
pub struct Awaiter<T: Send + 'static> {
    kind: AwaiterKind<T>,
    slot: SharedSlot<T>,
    installed: Option<ContextRef>,
    suspended: bool,
    finished: bool,
}

impl<T: Send + 'static> Awaiter<T> {
    fn with_kind(kind: AwaiterKind<T>) -> Self {
        Self {
            kind,
            slot: Arc::new(Mutex::new(Slot {
                outcome: None,
                waker: None,
                detached: false,
            })),
            installed: None,
            suspended: false,
            finished: false,
        }
    }

    /// An awaiter that resolves to `outcome` without suspending.
    pub fn ready(outcome: Outcome<T>) -> Self {
        let awaiter = Self::with_kind(AwaiterKind::Ready);
        awaiter.slot.lock().outcome = Some(outcome);
        awaiter
    }

    /// Bridges a future driven by some other machinery.
    ///
    /// The suspend hook spawns a dedicated thread that blocks on `future` with
    /// [`futures::executor::block_on`] and resumes the awaiter with its output.
    /// Useful for `futures::channel::oneshot` receivers and similar producers.
    pub fn external<F, E>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::blocking(move || futures::executor::block_on(future))
    }

    /// Runs a blocking closure on a dedicated thread and resumes with its result.
    pub fn blocking<F, E>(producer: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + Send + 'static,
        E: std::error::Error + Send + Sync + 'static,
    {
        let producer: Producer<T> = Box::new(move || producer().map_err(Error::external));
        Self::with_kind(AwaiterKind::ExternalFuture(Some(producer)))
    }

    pub(crate) fn nested(task: Box<dyn Completion<T>>) -> Self {
        Self::with_kind(AwaiterKind::NestedTask(task))
    }

    pub(crate) fn channel_read(party: ReadParty<T>) -> Self {
        Self::with_kind(AwaiterKind::ChannelRead(party))
    }

    pub(crate) fn channel_write(party: Box<dyn ChannelParty<T>>) -> Self {
        Self::with_kind(AwaiterKind::ChannelWrite(party))
    }

    /// Sets the context every resumption of this awaiter is dispatched on.
    ///
    /// Has no effect once the awaiter has suspended, or on a dispatch awaiter
    /// whose target is fixed at construction.
    pub(crate) fn install(&mut self, context: ContextRef) {
        if self.suspended || matches!(self.kind, AwaiterKind::Dispatch { .. }) {
            return;
        }
        self.installed = Some(context);
    }

    fn take_outcome(&self, waker: &Waker) -> Option<Outcome<T>> {
        let mut slot = self.slot.lock();
        let outcome = slot.outcome.take();
        if outcome.is_none() {
            match &slot.waker {
                Some(parked) if parked.will_wake(waker) => {}
                _ => slot.waker = Some(waker.clone()),
            }
        }
        outcome
    }

    fn suspend_hook(&mut self) {
        let resumer = Resumer {
            slot: Some(Arc::clone(&self.slot)),
            installed: self.installed.clone(),
        };
        trace!(kind = self.kind.name(), "awaiter suspending");
        match &mut self.kind {
            AwaiterKind::Ready => resumer.forget(),
            AwaiterKind::Dispatch { unit } => resumer.resume(Ok(unit())),
            AwaiterKind::Sleep { timer, delay, unit } => {
                let unit = *unit;
                if let Err(e) = timer.execute(move || resumer.resume(Ok(unit())), *delay) {
                    // The rejected callable dropped its resumer, which resumed with `Abandoned`.
                    trace!(error = %e, "sleep could not be scheduled");
                }
            }
            AwaiterKind::NestedTask(task) => {
                task.subscribe(resumer);
            }
            AwaiterKind::ExternalFuture(producer) => {
                let Some(producer) = producer.take() else {
                    resumer.resume(Err(Error::Abandoned));
                    return;
                };
                let spawned = thread::Builder::new()
                    .name("taskline-bridge".to_string())
                    .spawn(move || {
                        let outcome = panic::catch_unwind(AssertUnwindSafe(producer))
                            .unwrap_or_else(|payload| Err(Error::from_panic(payload)));
                        resumer.resume(outcome);
                    });
                if let Err(e) = spawned {
                    warn!(error = %e, "bridge thread could not be spawned");
                }
            }
            AwaiterKind::ChannelRead(party) => party.admit(resumer),
            AwaiterKind::ChannelWrite(party) => party.admit(resumer),
        }
    }

    fn resume_hook(&mut self, outcome: Outcome<T>) -> Outcome<T> {
        self.finished = true;
        match &mut self.kind {
            AwaiterKind::ChannelRead(party) => party.settle(),
            AwaiterKind::ChannelWrite(party) => party.settle(),
            _ => {}
        }
        outcome
    }
}

impl Awaiter<()> {
    /// Resumes right away on `target`.
    ///
    /// Awaiting this inside a task moves the rest of the body onto `target`
    /// until the next intercepted suspension brings it back to the task's
    /// own context.
    pub fn dispatch(target: ContextRef) -> Self {
        let mut awaiter = Self::with_kind(AwaiterKind::Dispatch { unit });
        awaiter.installed = Some(target);
        awaiter
    }

    /// Resumes after `delay`, as measured by `timer`.
    pub fn sleep(timer: TimerHandle, delay: Duration) -> Self {
        Self::with_kind(AwaiterKind::Sleep {
            timer,
            delay,
            unit,
        })
    }
}

fn unit() {}

impl<T: Send + 'static> Future for Awaiter<T> {
    type Output = Outcome<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.finished {
            panic!("`Awaiter` polled after completion");
        }
        if let Some(outcome) = this.take_outcome(cx.waker()) {
            return Poll::Ready(this.resume_hook(outcome));
        }
        if !this.suspended {
            this.suspended = true;
            this.suspend_hook();
            // Inline contexts and immediate channel matches resume during the hook.
            if let Some(outcome) = this.take_outcome(cx.waker()) {
                return Poll::Ready(this.resume_hook(outcome));
            }
        }
        Poll::Pending
    }
}

impl<T: Send + 'static> Drop for Awaiter<T> {
    fn drop(&mut self) {
        if !self.suspended || self.finished {
            return;
        }
        {
            let mut slot = self.slot.lock();
            slot.detached = true;
            slot.waker = None;
        }
        match &mut self.kind {
            AwaiterKind::ChannelRead(party) => party.withdraw(),
            AwaiterKind::ChannelWrite(party) => party.withdraw(),
            _ => {}
        }
        trace!(kind = self.kind.name(), "awaiter dropped before resumption");
    }
}

impl<T: Send + 'static> fmt::Debug for Awaiter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awaiter")
            .field("kind", &self.kind.name())
            .field("installed", &self.installed.is_some())
            .field("suspended", &self.suspended)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Conversion performed by [`Cx::wait`](crate::Cx::wait) before suspending.
///
/// A [`Duration`] becomes a sleep, a [`Task`] becomes a nested-task awaiter,
/// and an [`Awaiter`] passes through unchanged.
pub trait IntoAwaiter {
    /// Value produced when the suspension completes.
    type Output: Send + 'static;

    /// Builds the awaiter for this suspension, given the intercepting task's `Cx`.
    fn into_awaiter(self, cx: &Cx) -> Awaiter<Self::Output>;
}

impl<T: Send + 'static> IntoAwaiter for Awaiter<T> {
    type Output = T;

    fn into_awaiter(self, _cx: &Cx) -> Awaiter<T> {
        self
    }
}

impl IntoAwaiter for Duration {
    type Output = ();

    fn into_awaiter(self, cx: &Cx) -> Awaiter<()> {
        match cx.timer() {
            Some(timer) => Awaiter::sleep(timer.clone(), self),
            None => Awaiter::ready(Err(Error::NoTimer)),
        }
    }
}
