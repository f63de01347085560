// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Runtime context: typed configuration options plus the channel registry.
//!
//! Contexts form a chain. Option lookups fall through to the parent, so a
//! scope sees whatever the process-wide default context holds unless it
//! overrides it. Channels are never inherited: each context owns the
//! channels created through it, and they go away with it.
//!
//! The default context is the only global mutable state in the runtime.
//! It is created with the built-in defaults on first access and can be
//! replaced or reset explicitly.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock};

use crate::channel::{Channel, ChannelId, Endpoint};
use crate::continuation::CoroutineError;

/// Typed configuration key.
pub struct ConfigKey<T> {
    name: &'static str,
    _type: PhantomData<fn() -> T>,
}

impl<T> ConfigKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _type: PhantomData,
        }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for ConfigKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for ConfigKey<T> {}

impl<T> fmt::Debug for ConfigKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConfigKey({})", self.name)
    }
}

/// Receives every failure that ends a coroutine run.
pub type ExceptionHandler = Arc<dyn Fn(&CoroutineError) + Send + Sync>;

/// Handler invoked when a run fails. Defaults to logging the error.
pub const EXCEPTION_HANDLER: ConfigKey<ExceptionHandler> = ConfigKey::new("exception_handler");

/// Capacity of channels created lazily by [`Context::get_channel`].
pub const CHANNEL_CAPACITY: ConfigKey<usize> = ConfigKey::new("channel_capacity");

/// Size of the worker pool a scope starts for async runs.
pub const WORKER_THREADS: ConfigKey<usize> = ConfigKey::new("worker_threads");

/// Cancel the whole scope when any run in it fails.
pub const FAIL_FAST: ConfigKey<bool> = ConfigKey::new("fail_fast");

pub const DEFAULT_CHANNEL_CAPACITY: usize = 1;

fn default_worker_threads() -> usize {
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(1)
}

fn log_failure(error: &CoroutineError) {
    tracing::error!(error = %error, "unhandled coroutine failure");
}

struct ChannelSlot {
    typed: Arc<dyn Any + Send + Sync>,
    endpoint: Arc<dyn Endpoint>,
}

/// Configuration and channel registry for a scope (or the whole process).
pub struct Context {
    parent: Option<Arc<Context>>,
    options: RwLock<HashMap<&'static str, Arc<dyn Any + Send + Sync>>>,
    channels: Mutex<HashMap<(String, TypeId), ChannelSlot>>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut options: Vec<&str> = self.options.read().keys().copied().collect();
        options.sort_unstable();
        let mut channels: Vec<String> = self
            .channels
            .lock()
            .keys()
            .map(|(name, _)| name.clone())
            .collect();
        channels.sort_unstable();
        f.debug_struct("Context")
            .field("options", &options)
            .field("channels", &channels)
            .field("has_parent", &self.parent.is_some())
            .finish()
    }
}

impl Context {
    /// An empty root context.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::empty(None))
    }

    /// A root context holding the built-in defaults.
    pub fn with_defaults() -> Arc<Self> {
        let ctx = Self::empty(None);
        let handler: ExceptionHandler = Arc::new(log_failure);
        ctx.set(EXCEPTION_HANDLER, handler);
        ctx.set(CHANNEL_CAPACITY, DEFAULT_CHANNEL_CAPACITY);
        ctx.set(WORKER_THREADS, default_worker_threads());
        ctx.set(FAIL_FAST, false);
        Arc::new(ctx)
    }

    /// A context whose option lookups fall through to `parent`.
    pub fn child(parent: &Arc<Context>) -> Arc<Self> {
        Arc::new(Self::empty(Some(parent.clone())))
    }

    fn empty(parent: Option<Arc<Context>>) -> Self {
        Self {
            parent,
            options: RwLock::new(HashMap::new()),
            channels: Mutex::new(HashMap::new()),
        }
    }

    pub fn parent(&self) -> Option<&Arc<Context>> {
        self.parent.as_ref()
    }

    /// Set an option on this context, shadowing any inherited value.
    pub fn set<T: Send + Sync + 'static>(&self, key: ConfigKey<T>, value: T) {
        self.options.write().insert(key.name, Arc::new(value));
    }

    /// Look an option up here, then along the parent chain.
    pub fn get<T: Clone + 'static>(&self, key: ConfigKey<T>) -> Option<T> {
        let local = self
            .options
            .read()
            .get(key.name)
            .and_then(|value| value.downcast_ref::<T>().cloned());
        match local {
            Some(value) => Some(value),
            None => self.parent.as_ref().and_then(|p| p.get(key)),
        }
    }

    pub fn get_or<T: Clone + 'static>(&self, key: ConfigKey<T>, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// True if the option is set here or on an ancestor.
    pub fn has<T: Clone + 'static>(&self, key: ConfigKey<T>) -> bool {
        self.get(key).is_some()
    }

    /// Remove a locally set option. Inherited values become visible again.
    pub fn remove<T>(&self, key: ConfigKey<T>) -> bool {
        self.options.write().remove(key.name).is_some()
    }

    pub fn exception_handler(&self) -> ExceptionHandler {
        self.get(EXCEPTION_HANDLER)
            .unwrap_or_else(|| Arc::new(log_failure))
    }

    pub fn fail_fast(&self) -> bool {
        self.get_or(FAIL_FAST, false)
    }

    pub fn worker_threads(&self) -> usize {
        self.get(WORKER_THREADS)
            .unwrap_or_else(default_worker_threads)
            .max(1)
    }

    /// The channel for `id`, created with the configured
    /// [`CHANNEL_CAPACITY`] on first use.
    pub fn get_channel<T: Send + 'static>(&self, id: &ChannelId<T>) -> Arc<Channel<T>> {
        let capacity = self.get_or(CHANNEL_CAPACITY, DEFAULT_CHANNEL_CAPACITY);
        self.get_channel_with_capacity(id, capacity)
    }

    /// The channel for `id`, created with `capacity` on first use. An
    /// existing channel keeps its original capacity.
    pub fn get_channel_with_capacity<T: Send + 'static>(
        &self,
        id: &ChannelId<T>,
        capacity: usize,
    ) -> Arc<Channel<T>> {
        let key = (id.name().to_string(), TypeId::of::<T>());
        let mut channels = self.channels.lock();
        if let Some(slot) = channels.get(&key) {
            if let Ok(channel) = slot.typed.clone().downcast::<Channel<T>>() {
                return channel;
            }
        }

        tracing::trace!(channel = %id, capacity, "channel created");
        let channel = Arc::new(Channel::new(id.clone(), capacity));
        channels.insert(
            key,
            ChannelSlot {
                typed: channel.clone(),
                endpoint: channel.clone(),
            },
        );
        channel
    }

    pub fn has_channel<T: 'static>(&self, id: &ChannelId<T>) -> bool {
        self.channels
            .lock()
            .contains_key(&(id.name().to_string(), TypeId::of::<T>()))
    }

    /// Drop the registry entry for `id`. Holders of the channel keep it.
    pub fn remove_channel<T: Send + 'static>(&self, id: &ChannelId<T>) -> Option<Arc<Channel<T>>> {
        let slot = self
            .channels
            .lock()
            .remove(&(id.name().to_string(), TypeId::of::<T>()))?;
        slot.typed.downcast::<Channel<T>>().ok()
    }

    /// Cancel every channel registered here, waking all parked parties.
    pub(crate) fn cancel_channels(&self) {
        let endpoints: Vec<Arc<dyn Endpoint>> = self
            .channels
            .lock()
            .values()
            .map(|slot| slot.endpoint.clone())
            .collect();
        for endpoint in endpoints {
            tracing::trace!(channel = endpoint.name(), "channel cancelled");
            endpoint.cancel();
        }
    }

    pub(crate) fn clear_channels(&self) {
        self.channels.lock().clear();
    }
}

static DEFAULT_CONTEXT: RwLock<Option<Arc<Context>>> = RwLock::new(None);

/// The process-wide default context, created with the built-in defaults on
/// first access. New scopes inherit from it.
pub fn default_context() -> Arc<Context> {
    if let Some(ctx) = DEFAULT_CONTEXT.read().as_ref() {
        return ctx.clone();
    }
    DEFAULT_CONTEXT
        .write()
        .get_or_insert_with(Context::with_defaults)
        .clone()
}

/// Replace the default context. Scopes launched afterwards inherit from
/// `context`; running scopes keep the one they started with.
pub fn set_default_context(context: Arc<Context>) -> Option<Arc<Context>> {
    DEFAULT_CONTEXT.write().replace(context)
}

/// Drop the default context so the next access recreates the defaults.
pub fn reset_default_context() {
    *DEFAULT_CONTEXT.write() = None;
}
