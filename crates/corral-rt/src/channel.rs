// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels: typed, bounded rendezvous points.
//!
//! A channel holds a FIFO buffer of at most `capacity` values plus FIFO
//! queues of parked senders and receivers. Capacity 0 is a pure hand-off.
//!
//! Locking: every operation takes the channel's `gate` first and its
//! `state` second. A select holds the gates of all its candidate channels
//! (in address order) while it checks readiness and registers, so it
//! never observes one channel ready after being enqueued on another.
//!
//! Queue entries are only removed by a successful hand-off or by their
//! owner. Entries whose waiter already resolved elsewhere are skipped in
//! place until the owner withdraws them.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use thiserror::Error;

use crate::waiter::{Resolution, Waiter};

/// Errors from a blocking send. The unsent value is handed back.
#[derive(Debug, Error)]
pub enum SendError<T> {
    /// The owning scope was cancelled while the send was parked.
    #[error("send on channel cancelled")]
    Cancelled(T),
    /// No receiver or buffer space became available in time.
    #[error("send on channel timed out")]
    TimedOut(T),
}

impl<T> SendError<T> {
    /// Recover the value that was not sent.
    pub fn into_inner(self) -> T {
        match self {
            SendError::Cancelled(v) | SendError::TimedOut(v) => v,
        }
    }
}

/// Errors from a blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RecvError {
    /// The owning scope was cancelled while the receive was parked.
    #[error("receive on channel cancelled")]
    Cancelled,
    /// No value became available in time.
    #[error("receive on channel timed out")]
    TimedOut,
}

#[derive(Debug, Error)]
pub enum TrySendError<T> {
    /// Buffer is full and no receiver is waiting.
    #[error("channel is full")]
    Full(T),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// No value available right now.
    #[error("channel is empty")]
    Empty,
}

/// Typed, named channel key. Two ids are equal when both name and value
/// type match.
pub struct ChannelId<T> {
    name: Cow<'static, str>,
    _type: PhantomData<fn() -> T>,
}

impl<T> ChannelId<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name: Cow::Borrowed(name),
            _type: PhantomData,
        }
    }

    /// Id with a name built at runtime.
    pub fn from_name(name: impl Into<String>) -> Self {
        Self {
            name: Cow::Owned(name.into()),
            _type: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T> Clone for ChannelId<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            _type: PhantomData,
        }
    }
}

impl<T> PartialEq for ChannelId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl<T> Eq for ChannelId<T> {}

impl<T> Hash for ChannelId<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl<T> fmt::Debug for ChannelId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId<{}>({})", std::any::type_name::<T>(), self.name)
    }
}

impl<T> fmt::Display for ChannelId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Id of a channel carrying strings.
pub const fn string_channel(name: &'static str) -> ChannelId<String> {
    ChannelId::new(name)
}

/// Id of a channel carrying integers.
pub const fn int_channel(name: &'static str) -> ChannelId<i64> {
    ChannelId::new(name)
}

/// Id of a channel carrying booleans.
pub const fn bool_channel(name: &'static str) -> ChannelId<bool> {
    ChannelId::new(name)
}

struct SendEntry<T> {
    waiter: Arc<Waiter>,
    arm: usize,
    value: T,
}

struct RecvEntry {
    waiter: Arc<Waiter>,
    arm: usize,
}

struct State<T> {
    buffer: VecDeque<T>,
    senders: VecDeque<SendEntry<T>>,
    receivers: VecDeque<RecvEntry>,
    cancelled: bool,
}

/// A bounded channel shared by the coroutines of one scope.
pub struct Channel<T> {
    id: ChannelId<T>,
    capacity: usize,
    gate: Mutex<()>,
    state: Mutex<State<T>>,
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let st = self.state.lock();
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("buffered", &st.buffer.len())
            .field("senders", &st.senders.len())
            .field("receivers", &st.receivers.len())
            .field("cancelled", &st.cancelled)
            .finish()
    }
}

impl<T: Send + 'static> Channel<T> {
    pub fn new(id: ChannelId<T>, capacity: usize) -> Self {
        Self {
            id,
            capacity,
            gate: Mutex::new(()),
            state: Mutex::new(State {
                buffer: VecDeque::with_capacity(capacity),
                senders: VecDeque::new(),
                receivers: VecDeque::new(),
                cancelled: false,
            }),
        }
    }

    pub fn id(&self) -> &ChannelId<T> {
        &self.id
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of buffered values.
    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().buffer.is_empty()
    }

    /// True when no more values fit in the buffer. Always true for a
    /// zero-capacity channel.
    pub fn is_full(&self) -> bool {
        self.state.lock().buffer.len() >= self.capacity
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }

    /// Send, parking the calling thread while the buffer is full and no
    /// receiver is waiting.
    pub fn send_blocking(&self, value: T) -> Result<(), SendError<T>> {
        self.send_until(value, None)
    }

    /// Like [`send_blocking`](Self::send_blocking), giving up after `timeout`.
    pub fn send_timeout(&self, value: T, timeout: Duration) -> Result<(), SendError<T>> {
        self.send_until(value, Some(Instant::now() + timeout))
    }

    /// Receive, parking the calling thread until a value is available.
    pub fn receive_blocking(&self) -> Result<T, RecvError> {
        self.receive_until(None)
    }

    /// Like [`receive_blocking`](Self::receive_blocking), giving up after `timeout`.
    pub fn receive_timeout(&self, timeout: Duration) -> Result<T, RecvError> {
        self.receive_until(Some(Instant::now() + timeout))
    }

    /// Non-blocking send attempt.
    pub fn try_send(&self, value: T) -> Result<(), TrySendError<T>> {
        let _gate = self.gate.lock();
        self.offer_gated(value).map_err(TrySendError::Full)
    }

    /// Non-blocking receive attempt.
    pub fn try_receive(&self) -> Result<T, TryRecvError> {
        let _gate = self.gate.lock();
        self.take_gated().ok_or(TryRecvError::Empty)
    }

    fn send_until(&self, value: T, deadline: Option<Instant>) -> Result<(), SendError<T>> {
        let waiter = {
            let _gate = self.gate.lock();
            let value = match self.offer_gated(value) {
                Ok(()) => return Ok(()),
                Err(value) => value,
            };
            if self.is_cancelled() {
                return Err(SendError::Cancelled(value));
            }
            let waiter = Waiter::new();
            self.enqueue_sender_gated(&waiter, 0, value);
            waiter
        };

        tracing::trace!(channel = %self.id, "sender parked");
        let resolution = match deadline {
            Some(deadline) => waiter.park_until(deadline),
            None => waiter.park(),
        };
        match resolution {
            Resolution::Won { .. } => Ok(()),
            Resolution::Cancelled => match self.withdraw_sender(&waiter) {
                Some(value) => Err(SendError::Cancelled(value)),
                // A receiver took the value before the cancellation landed.
                None => Ok(()),
            },
            Resolution::TimedOut => match self.withdraw_sender(&waiter) {
                Some(value) => Err(SendError::TimedOut(value)),
                None => Ok(()),
            },
        }
    }

    fn receive_until(&self, deadline: Option<Instant>) -> Result<T, RecvError> {
        let waiter = {
            let _gate = self.gate.lock();
            if let Some(value) = self.take_gated() {
                return Ok(value);
            }
            if self.is_cancelled() {
                return Err(RecvError::Cancelled);
            }
            let waiter = Waiter::new();
            self.enqueue_receiver_gated(&waiter, 0);
            waiter
        };

        tracing::trace!(channel = %self.id, "receiver parked");
        let resolution = match deadline {
            Some(deadline) => waiter.park_until(deadline),
            None => waiter.park(),
        };
        match resolution {
            Resolution::Won { value, .. } => match value.map(|v| v.downcast::<T>()) {
                Some(Ok(v)) => Ok(*v),
                // Receiver entries of a Channel<T> are only fed values of T.
                _ => unreachable!("channel `{}` delivered a foreign value", self.id),
            },
            Resolution::Cancelled => {
                self.withdraw_waiter(&waiter);
                Err(RecvError::Cancelled)
            }
            Resolution::TimedOut => {
                self.withdraw_waiter(&waiter);
                Err(RecvError::TimedOut)
            }
        }
    }

    /// Take the next available value: buffer head first (refilling from
    /// the oldest live sender), otherwise straight from a live sender.
    /// Caller holds the gate.
    pub(crate) fn take_gated(&self) -> Option<T> {
        let mut st = self.state.lock();
        if let Some(value) = st.buffer.pop_front() {
            if let Some(refill) = pop_live_sender(&mut st.senders) {
                st.buffer.push_back(refill);
            }
            return Some(value);
        }
        pop_live_sender(&mut st.senders)
    }

    /// Hand `value` to the oldest live receiver, or buffer it. Returns the
    /// value if neither is possible. Caller holds the gate.
    pub(crate) fn offer_gated(&self, value: T) -> Result<(), T> {
        let mut st = self.state.lock();
        let mut slot = Some(value);
        let mut i = 0;
        while i < st.receivers.len() {
            let entry = &st.receivers[i];
            if entry.waiter.deliver(entry.arm, &mut slot) {
                st.receivers.remove(i);
                return Ok(());
            }
            i += 1;
        }

        let Some(value) = slot else {
            return Ok(());
        };
        if st.buffer.len() < self.capacity {
            st.buffer.push_back(value);
            Ok(())
        } else {
            Err(value)
        }
    }

    /// Caller holds the gate.
    pub(crate) fn enqueue_receiver_gated(&self, waiter: &Arc<Waiter>, arm: usize) {
        self.state.lock().receivers.push_back(RecvEntry {
            waiter: waiter.clone(),
            arm,
        });
    }

    /// Caller holds the gate.
    pub(crate) fn enqueue_sender_gated(&self, waiter: &Arc<Waiter>, arm: usize, value: T) {
        self.state.lock().senders.push_back(SendEntry {
            waiter: waiter.clone(),
            arm,
            value,
        });
    }

    fn withdraw_sender(&self, waiter: &Arc<Waiter>) -> Option<T> {
        let _gate = self.gate.lock();
        let mut st = self.state.lock();
        let pos = st
            .senders
            .iter()
            .position(|e| Arc::ptr_eq(&e.waiter, waiter))?;
        st.senders.remove(pos).map(|e| e.value)
    }

    fn withdraw_waiter(&self, waiter: &Arc<Waiter>) {
        let _gate = self.gate.lock();
        let mut st = self.state.lock();
        st.senders.retain(|e| !Arc::ptr_eq(&e.waiter, waiter));
        st.receivers.retain(|e| !Arc::ptr_eq(&e.waiter, waiter));
    }

    /// Wake every parked party with a cancellation and refuse to park from
    /// now on. Buffered values stay available.
    pub(crate) fn cancel(&self) {
        let _gate = self.gate.lock();
        let mut st = self.state.lock();
        st.cancelled = true;
        for entry in &st.senders {
            entry.waiter.cancel();
        }
        for entry in &st.receivers {
            entry.waiter.cancel();
        }
    }
}

fn pop_live_sender<T>(senders: &mut VecDeque<SendEntry<T>>) -> Option<T> {
    let mut i = 0;
    while i < senders.len() {
        let entry = &senders[i];
        if entry.waiter.release(entry.arm) {
            return senders.remove(i).map(|e| e.value);
        }
        i += 1;
    }
    None
}

/// Type-erased view of a channel, used by select and by scope teardown.
pub(crate) trait Endpoint: Send + Sync {
    fn name(&self) -> &str;
    /// Address used to order gate acquisition across channels.
    fn key(&self) -> usize;
    fn gate(&self) -> MutexGuard<'_, ()>;
    fn is_cancelled(&self) -> bool;
    fn withdraw(&self, waiter: &Arc<Waiter>);
    fn cancel(&self);
}

impl<T: Send + 'static> Endpoint for Channel<T> {
    fn name(&self) -> &str {
        self.id.name()
    }

    fn key(&self) -> usize {
        self as *const Self as *const () as usize
    }

    fn gate(&self) -> MutexGuard<'_, ()> {
        self.gate.lock()
    }

    fn is_cancelled(&self) -> bool {
        Channel::is_cancelled(self)
    }

    fn withdraw(&self, waiter: &Arc<Waiter>) {
        self.withdraw_waiter(waiter);
    }

    fn cancel(&self) {
        Channel::cancel(self);
    }
}
