use std::time::Duration;

use crate::{
    task::Cx,
    timing::{Delay, Timeout},
};

/// Extend `Future` with time-based operations scheduled on a task's timer.
pub trait TaskExt: Future {
    /// Defers polling `self` until `due` has elapsed.
    fn delay(self, cx: &Cx, due: Duration) -> Delay<Self>
    where
        Self: Sized,
    {
        Delay::new(cx, self, due)
    }

    /// Fails with [`Error::TimedOut`](crate::Error::TimedOut) unless `self`
    /// finishes within `time_limit`.
    fn timeout(self, cx: &Cx, time_limit: Duration) -> Timeout<Self>
    where
        Self: Sized,
    {
        Timeout::new(cx, self, time_limit)
    }
}

impl<T> TaskExt for T where T: Future {}
