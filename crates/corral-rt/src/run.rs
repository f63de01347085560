// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Run driver: executes one coroutine run step by step.
//!
//! A blocking run is driven on the calling thread and parks that thread
//! whenever a channel step has to wait. An async run is driven by pool
//! workers; when it has to wait it installs a wake hook on its waiter and
//! returns, and the hook submits it again once the waiter resolves.
//! Both modes use the same select engine, so a coroutine produces the
//! same outcome either way.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use crate::continuation::{CoroutineError, RunCell};
use crate::pool::PoolHandle;
use crate::scope::ScopeCore;
use crate::select::{Outcome, Poll, Selection};
use crate::step::{StepFault, StepKind, StepNode};
use crate::waiter::{Resolution, Value, WakeHook, Waiter};

pub(crate) enum Mode {
    Blocking,
    Async(PoolHandle),
}

/// A channel or select step waiting for its waiter to resolve.
struct Parked {
    selection: Selection,
    waiter: Arc<Waiter>,
    input: Value,
}

enum Advance {
    Next,
    Park(Parked),
    Done(Result<Value, CoroutineError>),
}

pub(crate) struct Run {
    cell: Arc<RunCell>,
    scope: Arc<ScopeCore>,
    steps: Arc<[StepNode]>,
    index: usize,
    value: Value,
    parked: Option<Parked>,
    mode: Mode,
}

fn unit() -> Value {
    Box::new(())
}

impl Run {
    pub fn new(
        cell: Arc<RunCell>,
        scope: Arc<ScopeCore>,
        steps: Arc<[StepNode]>,
        input: Value,
        mode: Mode,
    ) -> Box<Self> {
        Box::new(Self {
            cell,
            scope,
            steps,
            index: 0,
            value: input,
            parked: None,
            mode,
        })
    }

    /// Blocking runs return when terminal; async runs return once queued.
    pub fn start(self: Box<Self>) {
        tracing::trace!(run = self.cell.id(), coroutine = self.cell.name(), "run started");
        match &self.mode {
            Mode::Blocking => self.drive(),
            Mode::Async(pool) => {
                let pool = pool.clone();
                pool.submit(Box::new(move || self.drive()));
            }
        }
    }

    fn drive(mut self: Box<Self>) {
        let mut resumed = self.parked.take().map(|p| {
            let resolution = p.waiter.try_take();
            (p, resolution)
        });

        loop {
            let advance = match resumed.take() {
                Some((parked, Some(resolution))) => {
                    self.cell.unparked();
                    tracing::trace!(run = self.cell.id(), "run resumed");
                    self.resume(parked, resolution)
                }
                Some((parked, None)) => Advance::Park(parked),
                None => self.advance(),
            };

            let parked = match advance {
                Advance::Next => continue,
                Advance::Done(result) => return self.finish(result),
                Advance::Park(parked) => parked,
            };

            self.cell.parking_on(&parked.waiter);
            tracing::trace!(
                run = self.cell.id(),
                step = self.current_label(),
                "run parked"
            );
            let pool = match &self.mode {
                Mode::Blocking => None,
                Mode::Async(pool) => Some(pool.clone()),
            };
            match pool {
                None => {
                    let resolution = parked.waiter.park();
                    resumed = Some((parked, Some(resolution)));
                }
                Some(pool) => {
                    let waiter = parked.waiter.clone();
                    self.parked = Some(parked);
                    let hook: WakeHook = Box::new(move || pool.submit(Box::new(move || self.drive())));
                    if let Err(hook) = waiter.on_resolve(hook) {
                        hook();
                    }
                    return;
                }
            }
        }
    }

    fn current_label(&self) -> &str {
        self.steps
            .get(self.index)
            .map(|s| &*s.label)
            .unwrap_or("<end>")
    }

    /// Execute the current step up to completion or parking.
    fn advance(&mut self) -> Advance {
        let steps = self.steps.clone();
        let input = std::mem::replace(&mut self.value, unit());
        // A run whose last step completed is finished, cancelled or not.
        let Some(node) = steps.get(self.index) else {
            return Advance::Done(Ok(input));
        };
        if self.cell.is_cancel_requested() {
            return Advance::Done(Err(CoroutineError::Cancelled));
        }

        if let StepKind::Apply(f) = &node.kind {
            let result = guarded(&node.label, || f(input));
            return self.after(result);
        }

        let ctx = self.cell.context().clone();
        let bound = panic::catch_unwind(AssertUnwindSafe(|| Selection::bind(node, &ctx, &input)));
        let mut selection = match bound {
            Ok(Ok(selection)) => selection,
            Ok(Err((label, fault))) => return Advance::Done(Err(fault_error(&label, fault))),
            Err(payload) => {
                return Advance::Done(Err(CoroutineError::Panicked {
                    step: node.label.to_string(),
                    message: panic_message(&*payload),
                }))
            }
        };

        let cell = self.cell.clone();
        match selection.poll(|| cell.is_cancel_requested()) {
            Poll::Ready { arm, outcome } => {
                let result = outcome_value(&selection, arm, outcome, input);
                self.after(result)
            }
            Poll::Parked(waiter) => Advance::Park(Parked {
                selection,
                waiter,
                input,
            }),
            Poll::Cancelled => Advance::Done(Err(CoroutineError::Cancelled)),
        }
    }

    fn resume(&mut self, mut parked: Parked, resolution: Resolution) -> Advance {
        match parked.selection.complete(&parked.waiter, resolution) {
            Ok((arm, outcome)) => {
                let result = outcome_value(&parked.selection, arm, outcome, parked.input);
                self.after(result)
            }
            Err(e) => Advance::Done(Err(e)),
        }
    }

    fn after(&mut self, result: Result<Value, CoroutineError>) -> Advance {
        match result {
            Ok(value) => {
                self.value = value;
                self.index += 1;
                Advance::Next
            }
            Err(e) => Advance::Done(Err(e)),
        }
    }

    fn finish(self: Box<Self>, result: Result<Value, CoroutineError>) {
        self.cell.unparked();
        self.scope.finish_run(&self.cell, result);
    }
}

fn outcome_value(
    selection: &Selection,
    arm: usize,
    outcome: Outcome,
    input: Value,
) -> Result<Value, CoroutineError> {
    match outcome {
        Outcome::Received(value) => Ok(value),
        Outcome::Sent => Ok(input),
        Outcome::Immediate(f) => {
            let label = selection
                .arm_label(arm)
                .map(|l| l.to_string())
                .unwrap_or_default();
            guarded(&label, || f(input))
        }
    }
}

/// Run a step body, turning errors and panics into run failures.
fn guarded(
    label: &str,
    body: impl FnOnce() -> Result<Value, StepFault>,
) -> Result<Value, CoroutineError> {
    match panic::catch_unwind(AssertUnwindSafe(body)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(fault)) => Err(fault_error(label, fault)),
        Err(payload) => Err(CoroutineError::Panicked {
            step: label.to_string(),
            message: panic_message(&*payload),
        }),
    }
}

fn fault_error(label: &str, fault: StepFault) -> CoroutineError {
    match fault {
        StepFault::Error(cause) => CoroutineError::Failed {
            step: label.to_string(),
            cause,
        },
        StepFault::TypeMismatch => CoroutineError::TypeMismatch {
            step: label.to_string(),
        },
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
