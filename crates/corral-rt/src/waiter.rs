// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Single-shot parking slot shared by channel operations and select.
//!
//! A waiter is registered in one or more channel queues. The first party
//! to resolve it (a counterpart channel operation, a cancellation, or a
//! timeout) wins; every later attempt observes that it is no longer
//! pending and moves on. The owner either parks its thread on the condvar
//! (blocking runs) or installs a wake hook that reschedules it (async runs).

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Type-erased value travelling between steps and through channels.
pub(crate) type Value = Box<dyn Any + Send>;

/// Callback run once when a waiter resolves.
pub(crate) type WakeHook = Box<dyn FnOnce() + Send>;

/// How a waiter was resolved.
#[derive(Debug)]
pub(crate) enum Resolution {
    /// Arm `arm` completed. Receive arms carry the delivered value.
    Won { arm: usize, value: Option<Value> },
    Cancelled,
    TimedOut,
}

enum Slot {
    Pending,
    Resolved(Resolution),
    Taken,
}

struct Inner {
    slot: Slot,
    hook: Option<WakeHook>,
}

pub(crate) struct Waiter {
    inner: Mutex<Inner>,
    ready: Condvar,
}

impl fmt::Debug for Waiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Waiter")
            .field("pending", &self.is_pending())
            .finish()
    }
}

impl Waiter {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                slot: Slot::Pending,
                hook: None,
            }),
            ready: Condvar::new(),
        })
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.inner.lock().slot, Slot::Pending)
    }

    /// Resolve in favour of `arm`, moving the value out of `value`.
    /// On failure `value` is left untouched.
    pub fn deliver<T: Send + 'static>(&self, arm: usize, value: &mut Option<T>) -> bool {
        self.resolve(|| Resolution::Won {
            arm,
            value: value.take().map(|v| Box::new(v) as Value),
        })
    }

    /// Resolve in favour of `arm` without a value (a sender whose value
    /// was taken).
    pub fn release(&self, arm: usize) -> bool {
        self.resolve(|| Resolution::Won { arm, value: None })
    }

    pub fn cancel(&self) -> bool {
        self.resolve(|| Resolution::Cancelled)
    }

    fn resolve(&self, make: impl FnOnce() -> Resolution) -> bool {
        let mut inner = self.inner.lock();
        if !matches!(inner.slot, Slot::Pending) {
            return false;
        }
        inner.slot = Slot::Resolved(make());
        let hook = inner.hook.take();
        drop(inner);

        self.ready.notify_all();
        if let Some(hook) = hook {
            hook();
        }
        true
    }

    /// Install a hook to run on resolution. Hands the hook back if the
    /// waiter already resolved, so the caller can continue inline.
    pub fn on_resolve(&self, hook: WakeHook) -> Result<(), WakeHook> {
        let mut inner = self.inner.lock();
        if matches!(inner.slot, Slot::Pending) {
            inner.hook = Some(hook);
            Ok(())
        } else {
            Err(hook)
        }
    }

    /// Take the resolution without blocking.
    pub fn try_take(&self) -> Option<Resolution> {
        take_resolved(&mut self.inner.lock().slot)
    }

    /// Park the calling thread until resolved.
    pub fn park(&self) -> Resolution {
        let mut inner = self.inner.lock();
        loop {
            if let Some(r) = take_resolved(&mut inner.slot) {
                return r;
            }
            // Only the owning run parks, and it takes exactly once.
            if matches!(inner.slot, Slot::Taken) {
                return Resolution::Cancelled;
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Park until resolved or `deadline` passes. A timeout resolves the
    /// waiter itself, so no counterpart can complete it afterwards.
    pub fn park_until(&self, deadline: Instant) -> Resolution {
        let mut inner = self.inner.lock();
        loop {
            if let Some(r) = take_resolved(&mut inner.slot) {
                return r;
            }
            if matches!(inner.slot, Slot::Taken) {
                return Resolution::Cancelled;
            }
            if self.ready.wait_until(&mut inner, deadline).timed_out()
                && matches!(inner.slot, Slot::Pending)
            {
                inner.slot = Slot::Taken;
                inner.hook = None;
                return Resolution::TimedOut;
            }
        }
    }
}

fn take_resolved(slot: &mut Slot) -> Option<Resolution> {
    match std::mem::replace(slot, Slot::Taken) {
        Slot::Resolved(r) => Some(r),
        other => {
            *slot = other;
            None
        }
    }
}
