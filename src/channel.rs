//! A CSP-style channel connecting suspended producers and consumers.
//!
//! [`Channel`] holds a bounded FIFO buffer and two lists of suspended
//! parties. A capacity of zero makes every hand-off a rendezvous: a writer
//! stays suspended until a reader takes its value directly.
//!
//! Pending parties live in a registry keyed by a monotonically increasing
//! slot id, which doubles as their FIFO position. An awaiter dropped while
//! pending removes its own slot by id; if a peer already matched it, the
//! removal is a no-op. The channel never holds a pointer into an awaiter.
//!
//! All bookkeeping happens under one mutex, and the mutex is always released
//! before anyone is resumed, since resuming may run arbitrary task code that
//! uses the same channel again.
//!
//! # Example
//! ```
//! # use taskline::{Channel, Inline, Task};
//! let channel = Channel::new(1);
//! let tx = channel.clone();
//! let producer = Task::spawn(Inline, move |cx| async move {
//!     cx.wait(tx.write(7)).await?;
//!     Ok(())
//! });
//! let consumer = Task::spawn(Inline, move |cx| async move { cx.wait(channel.read()).await });
//! assert_eq!(consumer.blocking_result().unwrap(), 7);
//! producer.blocking_result().unwrap();
//! ```

use std::{
    collections::{BTreeMap, VecDeque},
    fmt,
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, Ordering},
    },
};

use parking_lot::Mutex;
use tracing::debug;

use crate::{
    awaiter::{Awaiter, Resumer},
    error::Error,
};

type SlotId = u64;

/// Suspension-side hooks of a channel operation, driven by its awaiter.
pub(crate) trait ChannelParty<T: Send + 'static>: Send {
    /// Applies the matching rule; enqueues the party if nothing matched.
    fn admit(&mut self, resumer: Resumer<T>);
    /// Marks the party as resumed, so dropping it no longer touches the channel.
    fn settle(&mut self);
    /// Removes the party from the channel if it is still pending.
    fn withdraw(&mut self);
}

// FIFO registry of suspended parties with removal by id.
struct PendingList<P> {
    entries: BTreeMap<SlotId, P>,
    next_id: SlotId,
}

impl<P> PendingList<P> {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_id: 0,
        }
    }

    fn push(&mut self, party: P) -> SlotId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.insert(id, party);
        id
    }

    fn pop_front(&mut self) -> Option<P> {
        self.entries.pop_first().map(|(_, party)| party)
    }

    fn remove(&mut self, id: SlotId) -> Option<P> {
        self.entries.remove(&id)
    }

    fn take_all(&mut self) -> Vec<P> {
        std::mem::take(&mut self.entries).into_values().collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct PendingWriter<T> {
    value: T,
    resumer: Resumer<()>,
}

struct ChannelState<T: Send + 'static> {
    buffer: VecDeque<T>,
    readers: PendingList<Resumer<T>>,
    writers: PendingList<PendingWriter<T>>,
}

struct ChannelShared<T: Send + 'static> {
    state: Mutex<ChannelState<T>>,
    capacity: usize,
    active: AtomicBool,
}

impl<T: Send + 'static> ChannelShared<T> {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn admit_reader(&self, reader: Resumer<T>) -> Option<SlotId> {
        let mut state = self.state.lock();
        if !self.is_active() {
            drop(state);
            reader.resume(Err(Error::ChannelClosed));
            return None;
        }

        if let Some(value) = state.buffer.pop_front() {
            // Room just opened up: the longest-waiting writer moves into the buffer.
            let mut promoted = None;
            if let Some(writer) = state.writers.pop_front() {
                state.buffer.push_back(writer.value);
                promoted = Some(writer.resumer);
            }
            drop(state);

            reader.resume(Ok(value));
            if let Some(writer) = promoted {
                writer.resume(Ok(()));
            }
            return None;
        }

        if let Some(writer) = state.writers.pop_front() {
            drop(state);
            reader.resume(Ok(writer.value));
            writer.resumer.resume(Ok(()));
            return None;
        }

        Some(state.readers.push(reader))
    }

    fn admit_writer(&self, value: T, writer: Resumer<()>) -> Option<SlotId> {
        let mut state = self.state.lock();
        if !self.is_active() {
            drop(state);
            writer.resume(Err(Error::ChannelClosed));
            return None;
        }

        if let Some(reader) = state.readers.pop_front() {
            drop(state);
            reader.resume(Ok(value));
            writer.resume(Ok(()));
            return None;
        }

        if state.buffer.len() < self.capacity {
            state.buffer.push_back(value);
            drop(state);
            writer.resume(Ok(()));
            return None;
        }

        Some(state.writers.push(PendingWriter {
            value,
            resumer: writer,
        }))
    }

    fn close(&self) {
        if self
            .active
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let (readers, writers, buffered) = {
            let mut state = self.state.lock();
            (
                state.readers.take_all(),
                state.writers.take_all(),
                std::mem::take(&mut state.buffer),
            )
        };
        debug!(
            readers = readers.len(),
            writers = writers.len(),
            discarded = buffered.len(),
            "channel closed"
        );

        for writer in writers {
            writer.resumer.resume(Err(Error::ChannelClosed));
        }
        for reader in readers {
            reader.resume(Err(Error::ChannelClosed));
        }
    }
}

impl<T: Send + 'static> Drop for ChannelShared<T> {
    fn drop(&mut self) {
        self.close();
    }
}

pub(crate) struct ReadParty<T: Send + 'static> {
    channel: Weak<ChannelShared<T>>,
    slot: Option<SlotId>,
}

impl<T: Send + 'static> ChannelParty<T> for ReadParty<T> {
    fn admit(&mut self, resumer: Resumer<T>) {
        match self.channel.upgrade() {
            Some(channel) => self.slot = channel.admit_reader(resumer),
            None => resumer.resume(Err(Error::ChannelClosed)),
        }
    }

    fn settle(&mut self) {
        self.slot = None;
    }

    fn withdraw(&mut self) {
        let (Some(id), Some(channel)) = (self.slot.take(), self.channel.upgrade()) else {
            return;
        };
        let removed = channel.state.lock().readers.remove(id);
        drop(removed);
    }
}

struct WriteParty<T: Send + 'static> {
    channel: Weak<ChannelShared<T>>,
    value: Option<T>,
    slot: Option<SlotId>,
}

impl<T: Send + 'static> ChannelParty<()> for WriteParty<T> {
    fn admit(&mut self, resumer: Resumer<()>) {
        let (Some(channel), Some(value)) = (self.channel.upgrade(), self.value.take()) else {
            resumer.resume(Err(Error::ChannelClosed));
            return;
        };
        self.slot = channel.admit_writer(value, resumer);
    }

    fn settle(&mut self) {
        self.slot = None;
    }

    fn withdraw(&mut self) {
        let (Some(id), Some(channel)) = (self.slot.take(), self.channel.upgrade()) else {
            return;
        };
        let removed = channel.state.lock().writers.remove(id);
        drop(removed);
    }
}

/// A bounded FIFO channel with rendezvous semantics.
///
/// Cloning yields another handle to the same channel. The channel closes when
/// [`close`](Self::close) is called or the last handle is dropped; pending
/// awaiters only keep a weak reference.
pub struct Channel<T: Send + 'static> {
    shared: Arc<ChannelShared<T>>,
}

impl<T: Send + 'static> Channel<T> {
    /// Creates a channel buffering up to `capacity` values.
    ///
    /// A capacity of `0` creates a pure rendezvous channel.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            shared: Arc::new(ChannelShared {
                state: Mutex::new(ChannelState {
                    buffer: VecDeque::with_capacity(capacity),
                    readers: PendingList::new(),
                    writers: PendingList::new(),
                }),
                capacity,
                active: AtomicBool::new(true),
            }),
        }
    }

    /// Receives the next value.
    ///
    /// Resolves immediately with [`Error::ChannelClosed`] on an inactive
    /// channel, and with the same error if the channel closes while waiting.
    pub fn read(&self) -> Awaiter<T> {
        if !self.shared.is_active() {
            return Awaiter::ready(Err(Error::ChannelClosed));
        }
        Awaiter::channel_read(ReadParty {
            channel: Arc::downgrade(&self.shared),
            slot: None,
        })
    }

    /// Sends `value`, suspending until a reader or a free buffer slot takes it.
    ///
    /// Resolves immediately with [`Error::ChannelClosed`] on an inactive
    /// channel, and with the same error if the channel closes while waiting.
    /// The value is dropped in both cases.
    pub fn write(&self, value: T) -> Awaiter<()> {
        if !self.shared.is_active() {
            return Awaiter::ready(Err(Error::ChannelClosed));
        }
        Awaiter::channel_write(Box::new(WriteParty {
            channel: Arc::downgrade(&self.shared),
            value: Some(value),
            slot: None,
        }))
    }

    /// Closes the channel, failing every pending reader and writer with
    /// [`Error::ChannelClosed`] and discarding buffered values.
    ///
    /// Only the first call has any effect.
    pub fn close(&self) {
        self.shared.close();
    }

    /// Returns `true` until the channel is closed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.shared.is_active()
    }

    /// Maximum number of buffered values.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Number of values currently buffered.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().buffer.len()
    }

    /// Returns `true` if no value is buffered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Send + 'static> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + 'static> Default for Channel<T> {
    fn default() -> Self {
        Self::new(0)
    }
}

impl<T: Send + 'static> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("Channel")
            .field("active", &self.shared.is_active())
            .field("capacity", &self.shared.capacity)
            .field("buffered", &state.buffer.len())
            .field("pending_readers", &state.readers.len())
            .field("pending_writers", &state.writers.len())
            .finish()
    }
}
