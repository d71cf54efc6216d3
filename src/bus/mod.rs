//! The bus facade: open/close, send/recv, batch and broadcast delivery.
//!
//! A [`Bus`] is a set of independently addressable bounded channels. Tasks
//! exchange [`Message`]s over them; a producer that finds a channel full and
//! a consumer that finds it empty park on the channel's wait queue and are
//! resumed when the condition clears.
//!
//! # Close safety
//!
//! [`Bus::close`] vacates the descriptor-table slot *before* waking any
//! parked waiter, and every waiter is unlinked from its queue before its
//! waker fires. A resumed task re-resolves the channel id on every poll, so
//! it observes [`BusError::NoChannel`] instead of touching the dying
//! channel. This ordering is the load-bearing invariant of the whole module.
//!
//! # Wakeup discipline
//!
//! Every state change wakes exactly as many counterparts as it enables: one
//! wake per message appended or popped, `k` wakes for a batch of `k`. A
//! blocking send or recv that consumed a wake re-issues one to its own side
//! when the condition still holds, so a chain of parked tasks drains without
//! a thundering herd.

pub mod futures;

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::channel::{Channel, Message};
use crate::error::{BusError, ErrorCode, Result};
use crate::table::DescriptorTable;

/// Identifier of an open channel: a small index into the descriptor table.
///
/// Ids are stable for the lifetime of the channel and may be reused after
/// [`Bus::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u32);

impl ChannelId {
    /// Constructs an id from its raw table index (primarily for testing).
    #[must_use]
    pub const fn from_index(index: u32) -> Self {
        Self(index)
    }

    /// Returns the raw table index.
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    pub(crate) fn from_usize(index: usize) -> Self {
        Self(u32::try_from(index).expect("descriptor table overflow"))
    }

    pub(crate) const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Monotonic counters describing bus activity.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BusMetrics {
    /// Channels created by [`Bus::open`].
    pub channels_opened: u64,
    /// Channels destroyed by [`Bus::close`].
    pub channels_closed: u64,
    /// Messages appended, broadcast deliveries included.
    pub messages_sent: u64,
    /// Messages popped.
    pub messages_received: u64,
    /// Completed broadcast deliveries.
    pub broadcasts: u64,
    /// Times a task parked on a full or empty channel.
    pub parks: u64,
}

/// Bus state behind the handle's lock.
#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) table: DescriptorTable<Channel>,
    pub(crate) last_error: ErrorCode,
    pub(crate) metrics: BusMetrics,
    /// Identity source for channel instances; lets a waiter parked across a
    /// close-and-reuse of its id tell the new occupant from its own channel.
    next_token: u64,
}

impl State {
    /// Records `err` in the error slot and hands it back for returning.
    pub(crate) fn fail(&mut self, err: BusError) -> BusError {
        self.last_error = err.code();
        err
    }

    pub(crate) fn try_send(&mut self, id: ChannelId, msg: Message) -> Result<()> {
        let Some(channel) = self.table.get_mut(id.as_usize()) else {
            return Err(self.fail(BusError::NoChannel));
        };
        if channel.is_full() {
            return Err(self.fail(BusError::WouldBlock));
        }
        channel.push(msg);
        channel.recv_waiters.wake_one();
        self.metrics.messages_sent += 1;
        self.last_error = ErrorCode::None;
        Ok(())
    }

    pub(crate) fn try_recv(&mut self, id: ChannelId) -> Result<Message> {
        let Some(channel) = self.table.get_mut(id.as_usize()) else {
            return Err(self.fail(BusError::NoChannel));
        };
        let Some(msg) = channel.pop() else {
            return Err(self.fail(BusError::WouldBlock));
        };
        channel.send_waiters.wake_one();
        self.metrics.messages_received += 1;
        self.last_error = ErrorCode::None;
        Ok(msg)
    }

    pub(crate) fn try_send_many(&mut self, id: ChannelId, buf: &[Message]) -> Result<usize> {
        let Some(channel) = self.table.get_mut(id.as_usize()) else {
            return Err(self.fail(BusError::NoChannel));
        };
        let moved = buf.len().min(channel.free_slots());
        if moved == 0 && !buf.is_empty() {
            return Err(self.fail(BusError::WouldBlock));
        }
        for &msg in &buf[..moved] {
            channel.push(msg);
        }
        for _ in 0..moved {
            channel.recv_waiters.wake_one();
        }
        self.metrics.messages_sent += moved as u64;
        self.last_error = ErrorCode::None;
        Ok(moved)
    }

    pub(crate) fn try_recv_many(&mut self, id: ChannelId, buf: &mut [Message]) -> Result<usize> {
        let Some(channel) = self.table.get_mut(id.as_usize()) else {
            return Err(self.fail(BusError::NoChannel));
        };
        let moved = buf.len().min(channel.len());
        if moved == 0 && !buf.is_empty() {
            return Err(self.fail(BusError::WouldBlock));
        }
        for slot in buf.iter_mut().take(moved) {
            *slot = channel.pop().expect("fifo drained below reported length");
        }
        for _ in 0..moved {
            channel.send_waiters.wake_one();
        }
        self.metrics.messages_received += moved as u64;
        self.last_error = ErrorCode::None;
        Ok(moved)
    }

    /// All-or-nothing delivery to every open channel.
    pub(crate) fn try_broadcast(&mut self, msg: Message) -> Result<()> {
        if self.table.occupied() == 0 {
            return Err(self.fail(BusError::NoChannel));
        }
        if self.table.iter().any(|(_, channel)| channel.is_full()) {
            return Err(self.fail(BusError::WouldBlock));
        }
        let mut delivered = 0u64;
        for (_, channel) in self.table.iter_mut() {
            channel.push(msg);
            channel.recv_waiters.wake_one();
            delivered += 1;
        }
        self.metrics.messages_sent += delivered;
        self.metrics.broadcasts += 1;
        self.last_error = ErrorCode::None;
        tracing::trace!(channels = delivered, "broadcast delivered");
        Ok(())
    }
}

/// Handle to an in-process message bus.
///
/// Cloning is cheap and every clone addresses the same channels. All
/// methods take `&self`; state lives behind an internal lock that is never
/// held across a suspension point.
#[derive(Debug, Clone, Default)]
pub struct Bus {
    state: Arc<Mutex<State>>,
}

impl Bus {
    /// Creates an empty bus with no channels.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("bus lock poisoned")
    }

    /// Opens a channel and returns its id.
    ///
    /// A requested `capacity` of 0 is promoted to 1. The id of the lowest
    /// vacated slot is reused before the descriptor table grows.
    pub fn open(&self, capacity: usize) -> ChannelId {
        let mut guard = self.lock();
        let state = &mut *guard;
        let token = state.next_token;
        state.next_token += 1;
        let id = ChannelId::from_usize(state.table.insert(Channel::new(capacity, token)));
        state.metrics.channels_opened += 1;
        state.last_error = ErrorCode::None;
        tracing::debug!(channel = %id, capacity = capacity.max(1), "channel opened");
        id
    }

    /// Closes a channel, releasing every parked waiter.
    ///
    /// Waiters resume to find the id vacated and their pending operation
    /// fails with [`BusError::NoChannel`]. Closing an id that is not open is
    /// a silent no-op; `close` never writes the error slot.
    pub fn close(&self, id: ChannelId) {
        let mut guard = self.lock();
        let state = &mut *guard;
        // Vacate the slot before waking anyone, so a resumed waiter that
        // re-resolves the id sees it gone.
        let Some(mut channel) = state.table.remove(id.as_usize()) else {
            return;
        };
        channel.send_waiters.wake_all();
        channel.recv_waiters.wake_all();
        state.metrics.channels_closed += 1;
        tracing::debug!(channel = %id, "channel closed");
    }

    /// Appends `msg`, parking until the channel has a free slot.
    #[must_use]
    pub fn send(&self, id: ChannelId, msg: Message) -> futures::Send<'_> {
        futures::Send::new(self, id, msg)
    }

    /// Appends `msg` if the channel has a free slot.
    ///
    /// # Errors
    ///
    /// [`BusError::NoChannel`] if `id` is not open, [`BusError::WouldBlock`]
    /// if the channel is full. The channel is not modified on failure.
    pub fn try_send(&self, id: ChannelId, msg: Message) -> Result<()> {
        self.lock().try_send(id, msg)
    }

    /// Pops the oldest message, parking until one is available.
    #[must_use]
    pub fn recv(&self, id: ChannelId) -> futures::Recv<'_> {
        futures::Recv::new(self, id)
    }

    /// Pops the oldest message if one is available.
    ///
    /// # Errors
    ///
    /// [`BusError::NoChannel`] if `id` is not open, [`BusError::WouldBlock`]
    /// if the channel is empty.
    pub fn try_recv(&self, id: ChannelId) -> Result<Message> {
        self.lock().try_recv(id)
    }

    /// Appends as many leading messages of `buf` as fit, parking first if
    /// none do. Resolves to the number appended; one receiver is woken per
    /// message. An empty `buf` resolves to 0 without parking.
    #[must_use]
    pub fn send_many<'a>(&'a self, id: ChannelId, buf: &'a [Message]) -> futures::SendMany<'a> {
        futures::SendMany::new(self, id, buf)
    }

    /// Non-blocking [`Bus::send_many`].
    ///
    /// # Errors
    ///
    /// [`BusError::NoChannel`] if `id` is not open, [`BusError::WouldBlock`]
    /// if `buf` is non-empty and the channel is full.
    pub fn try_send_many(&self, id: ChannelId, buf: &[Message]) -> Result<usize> {
        self.lock().try_send_many(id, buf)
    }

    /// Pops up to `buf.len()` messages into `buf`, parking first if the
    /// channel is empty. Resolves to the number popped; one sender is woken
    /// per message. An empty `buf` resolves to 0 without parking.
    #[must_use]
    pub fn recv_many<'a>(&'a self, id: ChannelId, buf: &'a mut [Message]) -> futures::RecvMany<'a> {
        futures::RecvMany::new(self, id, buf)
    }

    /// Non-blocking [`Bus::recv_many`].
    ///
    /// # Errors
    ///
    /// [`BusError::NoChannel`] if `id` is not open, [`BusError::WouldBlock`]
    /// if `buf` is non-empty and the channel is empty.
    pub fn try_recv_many(&self, id: ChannelId, buf: &mut [Message]) -> Result<usize> {
        self.lock().try_recv_many(id, buf)
    }

    /// Delivers `msg` to every open channel, atomically with respect to
    /// capacity: parks on a full channel until all channels can accept.
    #[must_use]
    pub fn broadcast(&self, msg: Message) -> futures::Broadcast<'_> {
        futures::Broadcast::new(self, msg)
    }

    /// Delivers `msg` to every open channel, or to none.
    ///
    /// # Errors
    ///
    /// [`BusError::NoChannel`] if no channel is open,
    /// [`BusError::WouldBlock`] if any open channel is full (no channel is
    /// modified in that case).
    pub fn try_broadcast(&self, msg: Message) -> Result<()> {
        self.lock().try_broadcast(msg)
    }

    /// Returns the outcome code of the most recent bus call.
    #[must_use]
    pub fn last_error(&self) -> ErrorCode {
        self.lock().last_error
    }

    /// Overwrites the error slot.
    pub fn set_last_error(&self, code: ErrorCode) {
        self.lock().last_error = code;
    }

    /// True if `id` currently resolves to an open channel. Does not touch
    /// the error slot.
    #[must_use]
    pub fn is_open(&self, id: ChannelId) -> bool {
        self.lock().table.get(id.as_usize()).is_some()
    }

    /// Number of currently open channels. Does not touch the error slot.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.lock().table.occupied()
    }

    /// Number of messages queued on a channel.
    ///
    /// # Errors
    ///
    /// [`BusError::NoChannel`] if `id` is not open.
    pub fn channel_len(&self, id: ChannelId) -> Result<usize> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.table.get(id.as_usize()) {
            Some(channel) => {
                let len = channel.len();
                state.last_error = ErrorCode::None;
                Ok(len)
            }
            None => Err(state.fail(BusError::NoChannel)),
        }
    }

    /// Capacity of a channel (always at least 1).
    ///
    /// # Errors
    ///
    /// [`BusError::NoChannel`] if `id` is not open.
    pub fn channel_capacity(&self, id: ChannelId) -> Result<usize> {
        let mut guard = self.lock();
        let state = &mut *guard;
        match state.table.get(id.as_usize()) {
            Some(channel) => {
                let capacity = channel.capacity();
                state.last_error = ErrorCode::None;
                Ok(capacity)
            }
            None => Err(state.fail(BusError::NoChannel)),
        }
    }

    /// Snapshot of the bus activity counters.
    #[must_use]
    pub fn metrics(&self) -> BusMetrics {
        self.lock().metrics
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        // A parked waiter keeps its bus handle alive through the borrow in
        // its future, so by the time the last handle drops every wait queue
        // must already be empty.
        #[cfg(debug_assertions)]
        if Arc::strong_count(&self.state) == 1 {
            if let Ok(state) = self.state.lock() {
                for (id, channel) in state.table.iter() {
                    assert!(
                        !channel.has_waiters(),
                        "bus dropped with waiters parked on channel {id}"
                    );
                }
            }
        }
    }
}
