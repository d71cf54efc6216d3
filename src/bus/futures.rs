//! Futures returned by the blocking bus operations.
//!
//! Each future re-runs its operation from scratch on every poll: resolve the
//! channel id, attempt the transfer, park on the channel's wait queue when
//! it cannot proceed. Re-resolving on every poll is what makes close safe:
//! a waiter resumed by [`Bus::close`](super::Bus::close) finds its id
//! vacated and fails with [`BusError::NoChannel`].
//!
//! A wake is a signal that must not be dropped, and a woken waiter holds
//! the head position of its queue. Two rules follow:
//!
//! - A waiter that was woken but remains blocked (another task claimed the
//!   condition first) re-parks at the *head* of its queue, so waiters
//!   behind it are still woken in enqueue order.
//! - A waiter that consumed a wake without using the condition re-issues
//!   `wake_one` on that queue: a dropped-while-woken future does this from
//!   its `Drop`, and a broadcast that migrates off a drained wait target
//!   does it before re-scanning. Otherwise a freed slot or queued message
//!   could strand the next waiter.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll, Waker};

use crate::channel::{Channel, Message};
use crate::error::{BusError, ErrorCode, Result};
use crate::table::DescriptorTable;
use crate::wait::WaitQueue;

use super::{Bus, ChannelId};

/// Which wait queue a parked operation sits on.
#[derive(Debug, Clone, Copy)]
enum WaitSide {
    Senders,
    Receivers,
}

/// Registration state of a parked operation.
#[derive(Debug, Clone, Copy)]
enum Park {
    Idle,
    Waiting { key: u64, token: u64 },
}

impl Park {
    /// Parks on `queue` (owned by the channel with `token`) or refreshes the
    /// existing entry. Returns true when newly enqueued.
    fn wait_on(&mut self, queue: &mut WaitQueue, token: u64, waker: &Waker) -> bool {
        if let Self::Waiting { key, token: parked } = *self {
            debug_assert_eq!(parked, token, "parked entry crossed channel instances");
            if queue.update(key, waker) {
                return false;
            }
            // Woken from the head but still blocked (another task claimed
            // the condition first). Take the head position back so waiters
            // parked behind this one are still woken after it.
            let key = queue.enqueue_front(waker.clone());
            *self = Self::Waiting { key, token };
            return true;
        }
        let key = queue.enqueue(waker.clone());
        *self = Self::Waiting { key, token };
        true
    }

    /// Unlinks this operation from `queue` if it is still there.
    fn leave(&mut self, queue: &mut WaitQueue) {
        if let Self::Waiting { key, .. } = *self {
            queue.remove(key);
        }
        *self = Self::Idle;
    }
}

/// Drop-side cleanup shared by every parked future.
fn cancel_parked(bus: &Bus, id: ChannelId, side: WaitSide, key: u64, token: u64) {
    let mut guard = bus.lock();
    let Some(channel) = guard.table.get_mut(id.as_usize()) else {
        return;
    };
    if channel.token != token {
        return;
    }
    let queue = match side {
        WaitSide::Senders => &mut channel.send_waiters,
        WaitSide::Receivers => &mut channel.recv_waiters,
    };
    if !queue.remove(key) {
        // Our wake was consumed without effect; pass it to the next waiter.
        queue.wake_one();
    }
}

/// Resolves `id` for a possibly-parked operation.
///
/// Fails with `NoChannel` when the id is vacated, and also when it is
/// occupied by a different channel instance than the one the operation
/// parked on (the id was closed and reused while it slept).
fn resolve<'t>(
    table: &'t mut DescriptorTable<Channel>,
    last_error: &mut ErrorCode,
    id: ChannelId,
    park: &mut Park,
) -> Result<&'t mut Channel> {
    let Some(channel) = table.get_mut(id.as_usize()) else {
        *park = Park::Idle;
        *last_error = ErrorCode::NoChannel;
        return Err(BusError::NoChannel);
    };
    if let Park::Waiting { token, .. } = *park {
        if token != channel.token {
            *park = Park::Idle;
            *last_error = ErrorCode::NoChannel;
            return Err(BusError::NoChannel);
        }
    }
    Ok(channel)
}

/// Future returned by [`Bus::send`](super::Bus::send).
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct Send<'a> {
    bus: &'a Bus,
    channel: ChannelId,
    msg: Message,
    park: Park,
}

impl<'a> Send<'a> {
    pub(crate) fn new(bus: &'a Bus, channel: ChannelId, msg: Message) -> Self {
        Self {
            bus,
            channel,
            msg,
            park: Park::Idle,
        }
    }
}

impl Future for Send<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut guard = this.bus.lock();
        let state = &mut *guard;

        let channel = match resolve(
            &mut state.table,
            &mut state.last_error,
            this.channel,
            &mut this.park,
        ) {
            Ok(channel) => channel,
            Err(err) => return Poll::Ready(Err(err)),
        };

        if channel.is_full() {
            let token = channel.token;
            if this.park.wait_on(&mut channel.send_waiters, token, ctx.waker()) {
                state.metrics.parks += 1;
                tracing::trace!(channel = %this.channel, "sender parked");
            }
            return Poll::Pending;
        }

        this.park.leave(&mut channel.send_waiters);
        channel.push(this.msg);
        channel.recv_waiters.wake_one();
        if !channel.is_full() {
            // Space remains: chain the wake to the next parked sender.
            channel.send_waiters.wake_one();
        }
        state.metrics.messages_sent += 1;
        state.last_error = ErrorCode::None;
        Poll::Ready(Ok(()))
    }
}

impl Drop for Send<'_> {
    fn drop(&mut self) {
        if let Park::Waiting { key, token } = self.park {
            cancel_parked(self.bus, self.channel, WaitSide::Senders, key, token);
        }
    }
}

/// Future returned by [`Bus::recv`](super::Bus::recv).
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct Recv<'a> {
    bus: &'a Bus,
    channel: ChannelId,
    park: Park,
}

impl<'a> Recv<'a> {
    pub(crate) fn new(bus: &'a Bus, channel: ChannelId) -> Self {
        Self {
            bus,
            channel,
            park: Park::Idle,
        }
    }
}

impl Future for Recv<'_> {
    type Output = Result<Message>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut guard = this.bus.lock();
        let state = &mut *guard;

        let channel = match resolve(
            &mut state.table,
            &mut state.last_error,
            this.channel,
            &mut this.park,
        ) {
            Ok(channel) => channel,
            Err(err) => return Poll::Ready(Err(err)),
        };

        let Some(msg) = channel.pop() else {
            let token = channel.token;
            if this.park.wait_on(&mut channel.recv_waiters, token, ctx.waker()) {
                state.metrics.parks += 1;
                tracing::trace!(channel = %this.channel, "receiver parked");
            }
            return Poll::Pending;
        };

        this.park.leave(&mut channel.recv_waiters);
        channel.send_waiters.wake_one();
        if !channel.is_empty() {
            // Messages remain: chain the wake to the next parked receiver.
            channel.recv_waiters.wake_one();
        }
        state.metrics.messages_received += 1;
        state.last_error = ErrorCode::None;
        Poll::Ready(Ok(msg))
    }
}

impl Drop for Recv<'_> {
    fn drop(&mut self) {
        if let Park::Waiting { key, token } = self.park {
            cancel_parked(self.bus, self.channel, WaitSide::Receivers, key, token);
        }
    }
}

/// Future returned by [`Bus::send_many`](super::Bus::send_many).
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct SendMany<'a> {
    bus: &'a Bus,
    channel: ChannelId,
    buf: &'a [Message],
    park: Park,
}

impl<'a> SendMany<'a> {
    pub(crate) fn new(bus: &'a Bus, channel: ChannelId, buf: &'a [Message]) -> Self {
        Self {
            bus,
            channel,
            buf,
            park: Park::Idle,
        }
    }
}

impl Future for SendMany<'_> {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut guard = this.bus.lock();
        let state = &mut *guard;

        let channel = match resolve(
            &mut state.table,
            &mut state.last_error,
            this.channel,
            &mut this.park,
        ) {
            Ok(channel) => channel,
            Err(err) => return Poll::Ready(Err(err)),
        };

        let moved = this.buf.len().min(channel.free_slots());
        if moved == 0 && !this.buf.is_empty() {
            let token = channel.token;
            if this.park.wait_on(&mut channel.send_waiters, token, ctx.waker()) {
                state.metrics.parks += 1;
                tracing::trace!(channel = %this.channel, count = this.buf.len(), "batch sender parked");
            }
            return Poll::Pending;
        }

        this.park.leave(&mut channel.send_waiters);
        for &msg in &this.buf[..moved] {
            channel.push(msg);
        }
        // One wake per message moved: each appended message enables exactly
        // one parked receiver.
        for _ in 0..moved {
            channel.recv_waiters.wake_one();
        }
        state.metrics.messages_sent += moved as u64;
        state.last_error = ErrorCode::None;
        Poll::Ready(Ok(moved))
    }
}

impl Drop for SendMany<'_> {
    fn drop(&mut self) {
        if let Park::Waiting { key, token } = self.park {
            cancel_parked(self.bus, self.channel, WaitSide::Senders, key, token);
        }
    }
}

/// Future returned by [`Bus::recv_many`](super::Bus::recv_many).
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct RecvMany<'a> {
    bus: &'a Bus,
    channel: ChannelId,
    buf: &'a mut [Message],
    park: Park,
}

impl<'a> RecvMany<'a> {
    pub(crate) fn new(bus: &'a Bus, channel: ChannelId, buf: &'a mut [Message]) -> Self {
        Self {
            bus,
            channel,
            buf,
            park: Park::Idle,
        }
    }
}

impl Future for RecvMany<'_> {
    type Output = Result<usize>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut guard = this.bus.lock();
        let state = &mut *guard;

        let channel = match resolve(
            &mut state.table,
            &mut state.last_error,
            this.channel,
            &mut this.park,
        ) {
            Ok(channel) => channel,
            Err(err) => return Poll::Ready(Err(err)),
        };

        let moved = this.buf.len().min(channel.len());
        if moved == 0 && !this.buf.is_empty() {
            let token = channel.token;
            if this.park.wait_on(&mut channel.recv_waiters, token, ctx.waker()) {
                state.metrics.parks += 1;
                tracing::trace!(channel = %this.channel, capacity = this.buf.len(), "batch receiver parked");
            }
            return Poll::Pending;
        }

        this.park.leave(&mut channel.recv_waiters);
        for slot in this.buf.iter_mut().take(moved) {
            *slot = channel.pop().expect("fifo drained below reported length");
        }
        // One wake per message moved: each freed slot enables exactly one
        // parked sender.
        for _ in 0..moved {
            channel.send_waiters.wake_one();
        }
        state.metrics.messages_received += moved as u64;
        state.last_error = ErrorCode::None;
        Poll::Ready(Ok(moved))
    }
}

impl Drop for RecvMany<'_> {
    fn drop(&mut self) {
        if let Park::Waiting { key, token } = self.park {
            cancel_parked(self.bus, self.channel, WaitSide::Receivers, key, token);
        }
    }
}

/// Where a blocking broadcast is currently parked.
#[derive(Debug, Clone, Copy)]
struct BroadcastPark {
    channel: ChannelId,
    key: u64,
    token: u64,
}

/// Future returned by [`Bus::broadcast`](super::Bus::broadcast).
#[must_use = "futures do nothing unless awaited"]
#[derive(Debug)]
pub struct Broadcast<'a> {
    bus: &'a Bus,
    msg: Message,
    wait: Option<BroadcastPark>,
}

impl<'a> Broadcast<'a> {
    pub(crate) fn new(bus: &'a Bus, msg: Message) -> Self {
        Self {
            bus,
            msg,
            wait: None,
        }
    }
}

impl Future for Broadcast<'_> {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, ctx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let mut guard = this.bus.lock();
        let state = &mut *guard;

        // Sticky wait: keep waiting on the same full channel until it drains
        // or goes away, then re-scan the whole table from scratch.
        if let Some(wait) = this.wait.take() {
            if let Some(channel) = state.table.get_mut(wait.channel.as_usize()) {
                if channel.token == wait.token {
                    if channel.is_full() {
                        let key = if channel.send_waiters.update(wait.key, ctx.waker()) {
                            wait.key
                        } else {
                            // Still full after a wake: take the head
                            // position back so later senders cannot
                            // overtake the broadcast on its wait target.
                            channel.send_waiters.enqueue_front(ctx.waker().clone())
                        };
                        this.wait = Some(BroadcastPark { key, ..wait });
                        return Poll::Pending;
                    }
                    if !channel.send_waiters.remove(wait.key) {
                        // The wake that resumed this broadcast signaled a
                        // freed slot here; the re-scan below may deliver or
                        // park elsewhere, so pass the slot to the next
                        // parked sender instead of dropping it.
                        channel.send_waiters.wake_one();
                    }
                }
            }
        }

        if state.table.occupied() == 0 {
            state.last_error = ErrorCode::NoChannel;
            return Poll::Ready(Err(BusError::NoChannel));
        }

        let full = state
            .table
            .iter()
            .find_map(|(id, channel)| channel.is_full().then_some(id));
        if let Some(id) = full {
            let channel = state
                .table
                .get_mut(id)
                .expect("full channel vanished during scan");
            let key = channel.send_waiters.enqueue(ctx.waker().clone());
            this.wait = Some(BroadcastPark {
                channel: ChannelId::from_usize(id),
                key,
                token: channel.token,
            });
            state.metrics.parks += 1;
            tracing::trace!(channel = id, "broadcast parked on full channel");
            return Poll::Pending;
        }

        let mut delivered = 0u64;
        for (_, channel) in state.table.iter_mut() {
            channel.push(this.msg);
            channel.recv_waiters.wake_one();
            delivered += 1;
        }
        state.metrics.messages_sent += delivered;
        state.metrics.broadcasts += 1;
        state.last_error = ErrorCode::None;
        tracing::trace!(channels = delivered, "broadcast delivered");
        Poll::Ready(Ok(()))
    }
}

impl Drop for Broadcast<'_> {
    fn drop(&mut self) {
        if let Some(wait) = self.wait {
            cancel_parked(self.bus, wait.channel, WaitSide::Senders, wait.key, wait.token);
        }
    }
}
