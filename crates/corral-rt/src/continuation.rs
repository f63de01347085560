// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Continuations: the observable result of one coroutine run.
//!
//! A run owns a `RunCell`. The scope, the driver and every `Continuation`
//! handle share it. The cell is written exactly once, when the run reaches
//! a terminal state; after that it only changes if the result is taken.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::cancel::CancelToken;
use crate::context::Context;
use crate::waiter::{Value, Waiter};

/// Why a coroutine run did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoroutineError {
    /// A step returned an error.
    #[error("step `{step}` failed: {cause}")]
    Failed { step: String, cause: String },
    /// A step panicked.
    #[error("step `{step}` panicked: {message}")]
    Panicked { step: String, message: String },
    /// The run or its scope was cancelled.
    #[error("coroutine cancelled")]
    Cancelled,
    /// Waiting for the result gave up.
    #[error("timed out waiting for coroutine result")]
    TimedOut,
    /// The result was already moved out with `take_result`.
    #[error("coroutine result already taken")]
    ResultTaken,
    /// A step was fed a value of an unexpected type.
    #[error("step `{step}` received a value of the wrong type")]
    TypeMismatch { step: String },
    /// The scope's worker pool could not be started.
    #[error("failed to start worker thread: {0}")]
    WorkerSpawn(String),
}

/// Externally visible state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunState::Running)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunState::Running => "running",
            RunState::Finished => "finished",
            RunState::Failed => "failed",
            RunState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

enum Completion {
    Running,
    Finished(Value),
    Taken,
    Failed(CoroutineError),
    Cancelled,
}

impl Completion {
    fn state(&self) -> RunState {
        match self {
            Completion::Running => RunState::Running,
            Completion::Finished(_) | Completion::Taken => RunState::Finished,
            Completion::Failed(_) => RunState::Failed,
            Completion::Cancelled => RunState::Cancelled,
        }
    }
}

static NEXT_RUN_ID: AtomicU64 = AtomicU64::new(1);

/// Shared state of a single run.
pub(crate) struct RunCell {
    id: u64,
    name: Arc<str>,
    context: Arc<Context>,
    cancel: CancelToken,
    /// Waiter the run is currently parked on, if any.
    current: Mutex<Option<Arc<Waiter>>>,
    completion: Mutex<Completion>,
    done: Condvar,
}

impl fmt::Debug for RunCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunCell")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

impl RunCell {
    pub fn new(name: Arc<str>, context: Arc<Context>, cancel: CancelToken) -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_RUN_ID.fetch_add(1, Ordering::Relaxed),
            name,
            context,
            cancel,
            current: Mutex::new(None),
            completion: Mutex::new(Completion::Running),
            done: Condvar::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Ask the run to stop. Returns false if it already terminated.
    pub fn request_cancel(&self) -> bool {
        if self.state().is_terminal() {
            return false;
        }
        self.cancel.cancel();
        self.poke();
        true
    }

    /// Wake the run with a cancellation if it is parked.
    pub fn poke(&self) {
        if let Some(waiter) = self.current.lock().as_ref() {
            waiter.cancel();
        }
    }

    /// Record the waiter the run is about to park on. A cancellation that
    /// raced ahead of the registration is applied here.
    pub fn parking_on(&self, waiter: &Arc<Waiter>) {
        *self.current.lock() = Some(waiter.clone());
        if self.cancel.is_cancelled() {
            waiter.cancel();
        }
    }

    pub fn unparked(&self) {
        *self.current.lock() = None;
    }

    pub fn state(&self) -> RunState {
        self.completion.lock().state()
    }

    /// Store the terminal result. Only the first call has any effect.
    pub fn complete(&self, result: Result<Value, CoroutineError>) {
        let mut completion = self.completion.lock();
        if !matches!(*completion, Completion::Running) {
            return;
        }
        *completion = match result {
            Ok(value) => Completion::Finished(value),
            Err(CoroutineError::Cancelled) => Completion::Cancelled,
            Err(error) => Completion::Failed(error),
        };
        drop(completion);
        self.done.notify_all();
    }

    pub fn wait(&self) -> RunState {
        let mut completion = self.completion.lock();
        while matches!(*completion, Completion::Running) {
            self.done.wait(&mut completion);
        }
        completion.state()
    }

    fn wait_until(&self, deadline: Instant) -> RunState {
        let mut completion = self.completion.lock();
        while matches!(*completion, Completion::Running) {
            if self.done.wait_until(&mut completion, deadline).timed_out() {
                break;
            }
        }
        completion.state()
    }

    pub fn error(&self) -> Option<CoroutineError> {
        match &*self.completion.lock() {
            Completion::Failed(e) => Some(e.clone()),
            Completion::Cancelled => Some(CoroutineError::Cancelled),
            _ => None,
        }
    }

    fn read<T: Clone + 'static>(&self) -> Option<Result<T, CoroutineError>> {
        match &*self.completion.lock() {
            Completion::Running => None,
            Completion::Finished(value) => Some(value.downcast_ref::<T>().cloned().ok_or_else(
                || CoroutineError::TypeMismatch {
                    step: self.name.to_string(),
                },
            )),
            Completion::Taken => Some(Err(CoroutineError::ResultTaken)),
            Completion::Failed(e) => Some(Err(e.clone())),
            Completion::Cancelled => Some(Err(CoroutineError::Cancelled)),
        }
    }

    fn take<T: 'static>(&self) -> Option<Result<T, CoroutineError>> {
        let mut completion = self.completion.lock();
        match std::mem::replace(&mut *completion, Completion::Taken) {
            Completion::Finished(value) => Some(value.downcast::<T>().map(|v| *v).map_err(|_| {
                CoroutineError::TypeMismatch {
                    step: self.name.to_string(),
                }
            })),
            other => {
                let out = match &other {
                    Completion::Running => None,
                    Completion::Taken => Some(Err(CoroutineError::ResultTaken)),
                    Completion::Failed(e) => Some(Err(e.clone())),
                    Completion::Cancelled => Some(Err(CoroutineError::Cancelled)),
                    Completion::Finished(_) => None,
                };
                *completion = other;
                out
            }
        }
    }
}

/// Handle to the result of a coroutine run.
///
/// Cheap to clone; all clones observe the same run.
pub struct Continuation<T> {
    cell: Arc<RunCell>,
    _type: PhantomData<fn() -> T>,
}

impl<T> Clone for Continuation<T> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
            _type: PhantomData,
        }
    }
}

impl<T> fmt::Debug for Continuation<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Continuation")
            .field("id", &self.cell.id())
            .field("coroutine", &self.cell.name())
            .field("state", &self.cell.state())
            .finish()
    }
}

impl<T: 'static> Continuation<T> {
    pub(crate) fn new(cell: Arc<RunCell>) -> Self {
        Self {
            cell,
            _type: PhantomData,
        }
    }

    pub fn id(&self) -> u64 {
        self.cell.id()
    }

    pub fn coroutine_name(&self) -> &str {
        self.cell.name()
    }

    /// Context of the scope the run belongs to.
    pub fn context(&self) -> &Arc<Context> {
        self.cell.context()
    }

    pub fn state(&self) -> RunState {
        self.cell.state()
    }

    /// True once the run reached any terminal state.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn is_failed(&self) -> bool {
        self.state() == RunState::Failed
    }

    pub fn is_cancelled(&self) -> bool {
        self.state() == RunState::Cancelled
    }

    /// The failure or cancellation that ended the run, if any.
    pub fn error(&self) -> Option<CoroutineError> {
        self.cell.error()
    }

    /// Block until the run terminates.
    pub fn await_completion(&self) -> RunState {
        self.cell.wait()
    }

    /// Request cancellation. A parked run wakes immediately; a running one
    /// stops at its next step boundary. Returns false if the run had
    /// already terminated.
    pub fn cancel(&self) -> bool {
        self.cell.request_cancel()
    }

    /// Block until the run terminates and return a clone of its result.
    pub fn get_result(&self) -> Result<T, CoroutineError>
    where
        T: Clone,
    {
        self.cell.wait();
        self.cell
            .read()
            .unwrap_or(Err(CoroutineError::TimedOut))
    }

    /// Like [`get_result`](Self::get_result), giving up after `timeout`.
    pub fn get_result_timeout(&self, timeout: Duration) -> Result<T, CoroutineError>
    where
        T: Clone,
    {
        self.cell.wait_until(Instant::now() + timeout);
        self.cell
            .read()
            .unwrap_or(Err(CoroutineError::TimedOut))
    }

    /// The result if the run already terminated.
    pub fn try_result(&self) -> Option<Result<T, CoroutineError>>
    where
        T: Clone,
    {
        self.cell.read()
    }

    /// Block until the run terminates and move the result out. Later
    /// reads report [`CoroutineError::ResultTaken`].
    pub fn take_result(&self) -> Result<T, CoroutineError> {
        self.cell.wait();
        self.cell
            .take()
            .unwrap_or(Err(CoroutineError::TimedOut))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn cell() -> Arc<RunCell> {
        RunCell::new("test".into(), Context::new(), CancelToken::new())
    }

    #[test]
    fn finished_result_is_readable_repeatedly() {
        let c = cell();
        let cont: Continuation<String> = Continuation::new(c.clone());
        assert_eq!(cont.state(), RunState::Running);
        assert!(cont.try_result().is_none());
        c.complete(Ok(Box::new("done".to_string())));
        assert!(cont.is_finished());
        assert_eq!(cont.get_result().unwrap(), "done");
        assert_eq!(cont.get_result().unwrap(), "done");
        assert_eq!(cont.error(), None);
    }

    #[test]
    fn first_completion_wins() {
        let c = cell();
        c.complete(Err(CoroutineError::Cancelled));
        c.complete(Ok(Box::new(1i64)));
        let cont: Continuation<i64> = Continuation::new(c);
        assert!(cont.is_cancelled());
        assert_eq!(cont.get_result(), Err(CoroutineError::Cancelled));
    }

    #[test]
    fn failure_is_reported() {
        let c = cell();
        let err = CoroutineError::Failed {
            step: "apply".into(),
            cause: "bad input".into(),
        };
        c.complete(Err(err.clone()));
        let cont: Continuation<i64> = Continuation::new(c);
        assert!(cont.is_failed());
        assert!(cont.is_finished());
        assert_eq!(cont.error(), Some(err.clone()));
        assert_eq!(cont.get_result(), Err(err));
    }

    #[test]
    fn take_result_moves_value_out() {
        let c = cell();
        c.complete(Ok(Box::new(vec![1u8, 2, 3])));
        let cont: Continuation<Vec<u8>> = Continuation::new(c);
        assert_eq!(cont.take_result().unwrap(), vec![1, 2, 3]);
        assert_eq!(cont.take_result(), Err(CoroutineError::ResultTaken));
        assert_eq!(cont.get_result(), Err(CoroutineError::ResultTaken));
        assert_eq!(cont.state(), RunState::Finished);
    }

    #[test]
    fn get_result_waits_for_completion() {
        let c = cell();
        let cont: Continuation<i64> = Continuation::new(c.clone());
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            c.complete(Ok(Box::new(5i64)));
        });
        assert_eq!(cont.get_result().unwrap(), 5);
        t.join().unwrap();
    }

    #[test]
    fn get_result_timeout_expires() {
        let cont: Continuation<i64> = Continuation::new(cell());
        assert_eq!(
            cont.get_result_timeout(Duration::from_millis(10)),
            Err(CoroutineError::TimedOut)
        );
        assert_eq!(cont.state(), RunState::Running);
    }

    #[test]
    fn cancel_pokes_parked_waiter() {
        let c = cell();
        let waiter = Waiter::new();
        c.parking_on(&waiter);
        let cont: Continuation<i64> = Continuation::new(c.clone());
        assert!(cont.cancel());
        assert!(!waiter.is_pending());
        assert!(c.is_cancel_requested());
    }

    #[test]
    fn cancel_before_parking_is_applied_on_park() {
        let c = cell();
        assert!(c.request_cancel());
        let waiter = Waiter::new();
        c.parking_on(&waiter);
        assert!(!waiter.is_pending());
    }

    #[test]
    fn cancel_after_completion_is_refused() {
        let c = cell();
        c.complete(Ok(Box::new(())));
        assert!(!c.request_cancel());
    }
}
