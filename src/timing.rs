//! Timing wrappers for futures that resolve to an [`Outcome`].
//!
//! Both wrappers sleep on the timer of the task they are created in, through
//! [`Cx::wait`], so their wake-ups come back on that task's context like any
//! other suspension.

use std::{
    ops::{Deref, DerefMut},
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use pin_project_lite::pin_project;

use crate::{
    awaiter::Awaiter,
    error::{Error, Outcome},
    task::Cx,
};

pin_project! {
    /// A future that begins polling its inner future only after a specified delay.
    ///
    /// The delay is counted from the first poll of the `Delay`. Once it has
    /// elapsed, every poll is delegated to the inner future.
    ///
    /// If the task has no timer, the `Delay` resolves to [`Error::NoTimer`]
    /// without ever polling the inner future.
    #[must_use = "futures do nothing unless polled or .awaited"]
    pub struct Delay<F> {
        #[pin]
        future: F,
        #[pin]
        sleep: Option<Awaiter<()>>,
    }
}

impl<F> Delay<F> {
    /// Creates a new `Delay` that defers the given future by `delay`.
    ///
    /// A more convenient way to construct this is via the
    /// [`delay()`](crate::TaskExt::delay) operator.
    pub fn new(cx: &Cx, future: F, delay: Duration) -> Self {
        Delay {
            future,
            sleep: Some(cx.wait(delay)),
        }
    }

    /// Consumes the `Delay` and returns the inner future.
    pub fn inner(self) -> F {
        self.future
    }
}

impl<F> Deref for Delay<F> {
    type Target = F;

    fn deref(&self) -> &Self::Target {
        &self.future
    }
}

impl<F> DerefMut for Delay<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.future
    }
}

impl<F, T> Future for Delay<F>
where
    F: Future<Output = Outcome<T>>,
{
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        if let Some(sleep) = this.sleep.as_mut().as_pin_mut() {
            match sleep.poll(cx) {
                Poll::Ready(Ok(())) => this.sleep.set(None),
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Pending => return Poll::Pending,
            }
        }
        this.future.poll(cx)
    }
}

pin_project! {
    /// A future that applies a time limit to another operation.
    ///
    /// If the inner future has not finished when the limit elapses, the
    /// `Timeout` resolves to [`Error::TimedOut`] and the inner future is left
    /// unpolled; dropping it releases whatever it was waiting on. The countdown
    /// starts at the first poll.
    ///
    /// If the task has no timer, the `Timeout` resolves to [`Error::NoTimer`]
    /// unless the inner future is ready on the first poll.
    #[must_use = "futures do nothing unless polled or .awaited"]
    pub struct Timeout<F> {
        #[pin]
        future: F,
        #[pin]
        limit: Awaiter<()>,
    }
}

impl<F> Timeout<F> {
    /// Creates a new `Timeout` that runs the given future with a time limit.
    ///
    /// For a more ergonomic way to create a timeout-wrapped future, consider
    /// using the [`timeout()`](crate::TaskExt::timeout) operator.
    pub fn new(cx: &Cx, future: F, time_limit: Duration) -> Self {
        Timeout {
            future,
            limit: cx.wait(time_limit),
        }
    }

    /// Consumes the `Timeout` and returns the inner future.
    pub fn inner(self) -> F {
        self.future
    }
}

impl<F> Deref for Timeout<F> {
    type Target = F;

    fn deref(&self) -> &Self::Target {
        &self.future
    }
}

impl<F> DerefMut for Timeout<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.future
    }
}

impl<F, T> Future for Timeout<F>
where
    F: Future<Output = Outcome<T>>,
{
    type Output = Outcome<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        if let Poll::Ready(outcome) = this.future.poll(cx) {
            return Poll::Ready(outcome);
        }
        match this.limit.poll(cx) {
            Poll::Ready(Ok(())) => Poll::Ready(Err(Error::TimedOut)),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }
}
