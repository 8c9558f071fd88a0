//! Error taxonomy and the single-assignment `Outcome` type.
//!
//! Every task and every suspension point resolves to exactly one [`Outcome`]:
//! either the produced value or an [`Error`]. Outcomes are handed to every
//! observer of a task, so the error type is cheap to clone.

use std::{any::Any, fmt, sync::Arc};

use thiserror::Error;

/// The terminal result of a task or of a single suspension point.
pub type Outcome<T> = Result<T, Error>;

/// Failures observed by tasks, awaiters and channels.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The channel was closed before or while the operation was pending.
    #[error("channel is closed")]
    ChannelClosed,

    /// A panic escaped a task body.
    #[error("task panicked: {0}")]
    Panicked(String),

    /// A task body gave up with an explicit failure.
    #[error("task failed: {0}")]
    Failed(String),

    /// A bridged external future or blocking closure failed.
    #[error("external producer failed: {0}")]
    External(Arc<dyn std::error::Error + Send + Sync>),

    /// The party responsible for resuming an awaiter went away without doing so.
    #[error("awaiter was abandoned before it could be resumed")]
    Abandoned,

    /// The timer scheduler no longer accepts callables.
    #[error("timer scheduler is shut down")]
    TimerShutdown,

    /// A duration was awaited inside a task that has no timer attached.
    #[error("no timer scheduler is attached to this task")]
    NoTimer,

    /// A timeout elapsed before the guarded operation finished.
    #[error("operation timed out")]
    TimedOut,

    /// An OS thread or a thread pool could not be started.
    #[error("failed to start thread: {0}")]
    Spawn(Arc<std::io::Error>),
}

impl Error {
    /// Builds an explicit task failure from any displayable message.
    pub fn failed(message: impl fmt::Display) -> Self {
        Error::Failed(message.to_string())
    }

    /// Wraps the error of an external producer.
    pub fn external(error: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::External(Arc::new(error))
    }

    /// Returns `true` for [`Error::ChannelClosed`].
    #[must_use]
    pub fn is_channel_closed(&self) -> bool {
        matches!(self, Error::ChannelClosed)
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "non-string panic payload".to_string()
        };
        Error::Panicked(message)
    }
}

impl From<std::io::Error> for Error {
    fn from(error: std::io::Error) -> Self {
        Error::Spawn(Arc::new(error))
    }
}
