//! Context-pinned tasks, CSP channels and a timer for asynchronous control flow.
//!
//! `taskline` runs `async` task bodies on execution contexts you choose and
//! guarantees that a task, once suspended, is resumed on its own context no
//! matter which thread completes the suspension.
//!
//! The crate does not need an async runtime. Tasks drive themselves: a
//! resumption is dispatched on the task's context and polls the body right
//! there. Tasks can still be awaited from tokio, smol or any other executor.
//!
//! Features include:
//! - A [`Task`] handle with blocking, callback and `async` observation of its outcome
//! - Pluggable [`ExecutionContext`]s: [`Inline`], [`DetachedThread`],
//!   [`PoolSubmit`] over a `futures` thread pool, and a single-threaded [`WorkerQueue`]
//! - [`Awaiter`]s for context dispatch, sleeps, nested tasks and external producers
//! - A bounded rendezvous [`Channel`] with FIFO matching and close semantics
//! - A deadline-ordered [`TimerScheduler`] on its own thread
//! - Time-based wrappers like [`Delay`] and [`Timeout`] via [`TaskExt`]
//!
//! # Example
//! ```
//! use std::time::Duration;
//! use taskline::{Channel, Task, TimerScheduler, WorkerQueue};
//!
//! let timer = TimerScheduler::new().unwrap();
//! let channel = Channel::new(0);
//!
//! let tx = channel.clone();
//! let producer = Task::with_timer(WorkerQueue::new().unwrap(), timer.handle(), |cx| async move {
//!     for i in 0..3 {
//!         cx.wait(Duration::from_millis(1)).await?;
//!         cx.wait(tx.write(i)).await?;
//!     }
//!     tx.close();
//!     Ok(())
//! });
//!
//! let consumer = Task::spawn(WorkerQueue::new().unwrap(), move |cx| async move {
//!     let mut received = Vec::new();
//!     loop {
//!         match cx.wait(channel.read()).await {
//!             Ok(v) => received.push(v),
//!             Err(e) if e.is_channel_closed() => return Ok(received),
//!             Err(e) => return Err(e),
//!         }
//!     }
//! });
//!
//! producer.blocking_result().unwrap();
//! assert_eq!(consumer.blocking_result().unwrap(), vec![0, 1, 2]);
//! ```

pub mod awaiter;
pub mod channel;
pub mod context;
pub mod error;
pub mod task;
pub mod task_ext;
pub mod timer;
pub mod timing;

pub use awaiter::{Awaiter, IntoAwaiter};
pub use channel::Channel;
pub use context::{
    ContextRef, DetachedThread, ExecutionContext, Inline, Job, PoolSubmit, WorkerQueue,
    WorkerQueueBuilder,
};
pub use error::{Error, Outcome};
pub use task::{Cx, Task, TaskBuilder, TaskId};
pub use task_ext::TaskExt;
pub use timer::{TimerHandle, TimerScheduler, TimerSchedulerBuilder};
pub use timing::{Delay, Timeout};
