// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coroutine scopes.
//!
//! `launch` opens a scope, runs the body, then waits until every run the
//! body started has terminated before returning. Nothing started inside a
//! scope outlives it: after draining, the worker pool is stopped and the
//! scope's channels are cancelled and dropped.
//!
//! Failure policy: a failed run is reported to the context's exception
//! handler. With `FAIL_FAST` set the scope is cancelled as well, which
//! stops all sibling runs. Cancellation is never reported as a failure.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::cancel::CancelToken;
use crate::channel::{Channel, ChannelId};
use crate::context::{default_context, Context};
use crate::continuation::{Continuation, CoroutineError, RunCell};
use crate::coroutine::Coroutine;
use crate::pool::WorkerPool;
use crate::run::{panic_message, Mode, Run};
use crate::waiter::Value;

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// State shared by a scope and every run inside it.
pub(crate) struct ScopeCore {
    id: u64,
    context: Arc<Context>,
    cancel: Arc<CancelToken>,
    runs: Mutex<HashMap<u64, Arc<RunCell>>>,
    drained: Condvar,
    pool: WorkerPool,
}

impl ScopeCore {
    fn register(&self, cell: &Arc<RunCell>) {
        self.runs.lock().insert(cell.id(), cell.clone());
    }

    fn unregister(&self, id: u64) {
        let mut runs = self.runs.lock();
        runs.remove(&id);
        if runs.is_empty() {
            self.drained.notify_all();
        }
    }

    fn drain(&self) {
        let mut runs = self.runs.lock();
        while !runs.is_empty() {
            self.drained.wait(&mut runs);
        }
    }

    /// Cancel the scope: flag every run, wake the parked ones and cancel
    /// the scope's channels.
    fn cancel(&self) {
        if self.cancel.cancel() {
            tracing::debug!(scope = self.id, "scope cancelled");
        }
        for cell in self.runs.lock().values() {
            cell.poke();
        }
        self.context.cancel_channels();
    }

    /// Called by the driver once a run reached a terminal state.
    pub(crate) fn finish_run(&self, cell: &Arc<RunCell>, result: Result<Value, CoroutineError>) {
        match &result {
            Ok(_) => tracing::trace!(scope = self.id, run = cell.id(), "run finished"),
            Err(CoroutineError::Cancelled) => {
                tracing::debug!(scope = self.id, run = cell.id(), "run cancelled")
            }
            Err(error) => {
                tracing::debug!(
                    scope = self.id,
                    run = cell.id(),
                    coroutine = cell.name(),
                    %error,
                    "run failed"
                );
                let handler = cell.context().exception_handler();
                if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| handler(error))) {
                    tracing::error!(
                        scope = self.id,
                        panic = %panic_message(&*payload),
                        "exception handler panicked"
                    );
                }
                if cell.context().fail_fast() {
                    self.cancel();
                }
            }
        }
        cell.complete(result);
        self.unregister(cell.id());
    }
}

/// Handle passed to the body of [`launch`].
pub struct CoroutineScope {
    core: Arc<ScopeCore>,
}

impl fmt::Debug for CoroutineScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoroutineScope")
            .field("id", &self.core.id)
            .field("active", &self.active_count())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CoroutineScope {
    fn open(parent: &Arc<Context>) -> Result<Self, CoroutineError> {
        let id = NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed);
        let context = Context::child(parent);
        let pool = WorkerPool::start(&format!("corral-{}", id), context.worker_threads())?;
        tracing::debug!(scope = id, threads = pool.threads(), "scope opened");
        Ok(Self {
            core: Arc::new(ScopeCore {
                id,
                context,
                cancel: Arc::new(CancelToken::new()),
                runs: Mutex::new(HashMap::new()),
                drained: Condvar::new(),
                pool,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Configuration and channel registry of this scope. Options not set
    /// here are looked up in the context the scope was launched from.
    pub fn context(&self) -> &Arc<Context> {
        &self.core.context
    }

    /// Shorthand for `self.context().get_channel(id)`.
    pub fn get_channel<T: Send + 'static>(&self, id: &ChannelId<T>) -> Arc<Channel<T>> {
        self.core.context.get_channel(id)
    }

    /// Start `coroutine` on the worker pool and return immediately.
    pub fn run_async<I, O>(&self, coroutine: &Coroutine<I, O>, input: I) -> Continuation<O>
    where
        I: Send + 'static,
        O: 'static,
    {
        let (run, cont) = self.prepare(coroutine, input, Mode::Async(self.core.pool.handle()));
        run.start();
        cont
    }

    /// Run `coroutine` on the calling thread. The returned continuation is
    /// already terminal.
    pub fn run_blocking<I, O>(&self, coroutine: &Coroutine<I, O>, input: I) -> Continuation<O>
    where
        I: Send + 'static,
        O: 'static,
    {
        let (run, cont) = self.prepare(coroutine, input, Mode::Blocking);
        run.start();
        cont
    }

    fn prepare<I, O>(
        &self,
        coroutine: &Coroutine<I, O>,
        input: I,
        mode: Mode,
    ) -> (Box<Run>, Continuation<O>)
    where
        I: Send + 'static,
        O: 'static,
    {
        let cell = RunCell::new(
            coroutine.name_arc(),
            self.core.context.clone(),
            CancelToken::child(&self.core.cancel),
        );
        self.core.register(&cell);
        let run = Run::new(
            cell.clone(),
            self.core.clone(),
            coroutine.steps(),
            Box::new(input),
            mode,
        );
        (run, Continuation::new(cell))
    }

    /// Cancel every run in the scope. Parked runs wake immediately.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.cancel.is_cancelled()
    }

    /// Number of runs that have not terminated yet.
    pub fn active_count(&self) -> usize {
        self.core.runs.lock().len()
    }

    fn close(self) {
        self.core.drain();
        self.core.pool.shutdown();
        self.core.context.cancel_channels();
        self.core.context.clear_channels();
        tracing::debug!(scope = self.core.id, "scope closed");
    }
}

/// Open a scope inheriting from the default context, run `body` in it and
/// wait for every run it started.
///
/// Run failures do not surface here; they go to the exception handler and
/// to the continuations. Only scope setup can fail. A panic in `body`
/// cancels the scope, waits for it to drain and is then resumed.
pub fn launch<R>(body: impl FnOnce(&CoroutineScope) -> R) -> Result<R, CoroutineError> {
    launch_in(&default_context(), body)
}

/// Like [`launch`], inheriting from `parent` instead of the default context.
pub fn launch_in<R>(
    parent: &Arc<Context>,
    body: impl FnOnce(&CoroutineScope) -> R,
) -> Result<R, CoroutineError> {
    let scope = CoroutineScope::open(parent)?;
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&scope)));
    if outcome.is_err() {
        scope.cancel();
    }
    scope.close();
    match outcome {
        Ok(value) => Ok(value),
        Err(payload) => panic::resume_unwind(payload),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::WORKER_THREADS;
    use crate::coroutine::first;
    use crate::step::apply;

    fn ctx() -> Arc<Context> {
        let ctx = Context::with_defaults();
        ctx.set(WORKER_THREADS, 2);
        ctx
    }

    #[test]
    fn launch_returns_body_value() {
        let out = launch_in(&ctx(), |scope| {
            assert_eq!(scope.active_count(), 0);
            assert!(!scope.is_cancelled());
            42
        })
        .unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn scope_context_inherits_parent_options() {
        let parent = ctx();
        launch_in(&parent, |scope| {
            assert_eq!(scope.context().worker_threads(), 2);
            assert!(Arc::ptr_eq(scope.context().parent().unwrap(), &parent));
        })
        .unwrap();
    }

    #[test]
    fn blocking_run_is_terminal_on_return() {
        let double: Coroutine<i64, i64> = first(apply(|x: i64| x * 2));
        launch_in(&ctx(), |scope| {
            let cont = scope.run_blocking(&double, 21);
            assert!(cont.is_finished());
            assert_eq!(cont.get_result().unwrap(), 42);
            assert_eq!(scope.active_count(), 0);
        })
        .unwrap();
    }

    #[test]
    fn scope_ids_are_unique() {
        let a = launch_in(&ctx(), |scope| scope.id()).unwrap();
        let b = launch_in(&ctx(), |scope| scope.id()).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn body_panic_is_resumed_after_drain() {
        let result = panic::catch_unwind(|| {
            let _ = launch_in(&ctx(), |_scope| -> () { panic!("body failed") });
        });
        let payload = result.unwrap_err();
        assert_eq!(panic_message(&*payload), "body failed");
    }
}
