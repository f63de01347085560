// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Select: wait on several channel operations and commit to exactly one.
//!
//! Resolution runs in two phases.
//!
//! 1. Lock the gates of every candidate channel in address order, then
//!    check the candidates in declaration order. The first ready one wins
//!    on the spot. A function step is always ready.
//! 2. Nothing ready: register one shared waiter on every candidate while
//!    still holding the gates, release them and park. The counterpart that
//!    resolves the waiter first wins; every other registration goes stale
//!    and is withdrawn once the owner wakes.
//!
//! A single receive or send step is a select with one candidate, so plain
//! channel steps and selects share this engine in both run modes.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::MutexGuard;

use crate::channel::{Channel, Endpoint};
use crate::context::Context;
use crate::continuation::CoroutineError;
use crate::step::{ApplyFn, Step, StepFault, StepKind, StepNode};
use crate::waiter::{Resolution, Value, Waiter};

/// Builder for a select step. Candidates are tried in the order given.
pub struct Select<I, O> {
    candidates: Vec<StepNode>,
    _type: PhantomData<fn(I) -> O>,
}

impl<I, O> fmt::Debug for Select<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.candidates).finish()
    }
}

/// Start a select with its first candidate.
pub fn select<I, O>(step: impl Into<Step<I, O>>) -> Select<I, O> {
    let mut sel = Select {
        candidates: Vec::new(),
        _type: PhantomData,
    };
    sel.push(step.into().into_node());
    sel
}

impl<I, O> Select<I, O> {
    /// Add another candidate. A nested select contributes its candidates.
    pub fn or(mut self, step: impl Into<Step<I, O>>) -> Self {
        self.push(step.into().into_node());
        self
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    fn push(&mut self, node: StepNode) {
        match node.kind {
            StepKind::Select(children) => self.candidates.extend(children),
            _ => self.candidates.push(node),
        }
    }
}

impl<I, O> From<Select<I, O>> for Step<I, O> {
    fn from(sel: Select<I, O>) -> Self {
        let labels: Vec<&str> = sel.candidates.iter().map(|c| &*c.label).collect();
        let label = format!("select({})", labels.join(" | "));
        Step::from_node(StepNode {
            label: label.into(),
            kind: StepKind::Select(sel.candidates),
        })
    }
}

/// What a winning candidate produced.
pub(crate) enum Outcome {
    Received(Value),
    /// The send went through; the step passes its input on.
    Sent,
    /// A function candidate won; the driver applies it to the input.
    Immediate(ApplyFn),
}

/// A channel operation bound to a concrete channel for one execution.
pub(crate) trait ChannelArm: Send {
    fn endpoint(&self) -> Arc<dyn Endpoint>;
    /// Complete without parking if the channel allows. Caller holds the gate.
    fn try_now(&mut self) -> Option<Outcome>;
    /// Queue `waiter` on the channel. Caller holds the gate.
    fn register(&mut self, waiter: &Arc<Waiter>, arm: usize);
}

struct ReceiveArm<T> {
    channel: Arc<Channel<T>>,
}

impl<T: Send + 'static> ChannelArm for ReceiveArm<T> {
    fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.channel.clone()
    }

    fn try_now(&mut self) -> Option<Outcome> {
        self.channel
            .take_gated()
            .map(|v| Outcome::Received(Box::new(v)))
    }

    fn register(&mut self, waiter: &Arc<Waiter>, arm: usize) {
        self.channel.enqueue_receiver_gated(waiter, arm);
    }
}

struct SendArm<T> {
    channel: Arc<Channel<T>>,
    value: Option<T>,
}

impl<T: Send + 'static> ChannelArm for SendArm<T> {
    fn endpoint(&self) -> Arc<dyn Endpoint> {
        self.channel.clone()
    }

    fn try_now(&mut self) -> Option<Outcome> {
        let value = self.value.take()?;
        match self.channel.offer_gated(value) {
            Ok(()) => Some(Outcome::Sent),
            Err(value) => {
                self.value = Some(value);
                None
            }
        }
    }

    fn register(&mut self, waiter: &Arc<Waiter>, arm: usize) {
        if let Some(value) = self.value.take() {
            self.channel.enqueue_sender_gated(waiter, arm, value);
        }
    }
}

pub(crate) fn receive_arm<T: Send + 'static>(channel: Arc<Channel<T>>) -> Box<dyn ChannelArm> {
    Box::new(ReceiveArm { channel })
}

pub(crate) fn send_arm<T: Send + 'static>(channel: Arc<Channel<T>>, value: T) -> Box<dyn ChannelArm> {
    Box::new(SendArm {
        channel,
        value: Some(value),
    })
}

enum Arm {
    Channel {
        op: Box<dyn ChannelArm>,
        endpoint: Arc<dyn Endpoint>,
    },
    Immediate(ApplyFn),
}

struct Candidate {
    label: Arc<str>,
    arm: Arm,
}

/// Result of phase one.
pub(crate) enum Poll {
    Ready { arm: usize, outcome: Outcome },
    Parked(Arc<Waiter>),
    Cancelled,
}

/// One execution of a channel or select step.
pub(crate) struct Selection {
    candidates: Vec<Candidate>,
}

impl fmt::Debug for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.candidates.iter().map(|c| &*c.label))
            .finish()
    }
}

impl Selection {
    /// Resolve the channels of `node` in `ctx` and compute send values from
    /// `input`. On failure returns the label of the offending candidate.
    pub fn bind(node: &StepNode, ctx: &Context, input: &Value) -> Result<Self, (Arc<str>, StepFault)> {
        let nodes = match &node.kind {
            StepKind::Select(children) => children.as_slice(),
            _ => std::slice::from_ref(node),
        };
        let mut candidates = Vec::with_capacity(nodes.len());
        for n in nodes {
            let arm = match &n.kind {
                StepKind::Receive(bind) => Arm::from_op(bind(ctx)),
                StepKind::Send(bind) => {
                    Arm::from_op(bind(ctx, input).map_err(|fault| (n.label.clone(), fault))?)
                }
                StepKind::Apply(f) => Arm::Immediate(f.clone()),
                // Builders flatten nested selects.
                StepKind::Select(_) => return Err((n.label.clone(), StepFault::TypeMismatch)),
            };
            candidates.push(Candidate {
                label: n.label.clone(),
                arm,
            });
        }
        Ok(Self { candidates })
    }

    pub fn arm_label(&self, arm: usize) -> Option<&Arc<str>> {
        self.candidates.get(arm).map(|c| &c.label)
    }

    fn endpoints(&self) -> Vec<Arc<dyn Endpoint>> {
        self.candidates
            .iter()
            .filter_map(|c| match &c.arm {
                Arm::Channel { endpoint, .. } => Some(endpoint.clone()),
                Arm::Immediate(_) => None,
            })
            .collect()
    }

    /// Phase one: take a ready candidate, or register on all of them.
    /// `cancelled` is checked under the gates, after the readiness check.
    pub fn poll(&mut self, cancelled: impl Fn() -> bool) -> Poll {
        let mut endpoints = self.endpoints();
        endpoints.sort_by_key(|e| e.key());
        endpoints.dedup_by_key(|e| e.key());
        let _gates: Vec<MutexGuard<'_, ()>> = endpoints.iter().map(|e| e.gate()).collect();

        for (i, candidate) in self.candidates.iter_mut().enumerate() {
            match &mut candidate.arm {
                Arm::Immediate(f) => {
                    return Poll::Ready {
                        arm: i,
                        outcome: Outcome::Immediate(f.clone()),
                    }
                }
                Arm::Channel { op, .. } => {
                    if let Some(outcome) = op.try_now() {
                        return Poll::Ready { arm: i, outcome };
                    }
                }
            }
        }

        if cancelled() || endpoints.iter().any(|e| e.is_cancelled()) {
            return Poll::Cancelled;
        }

        let waiter = Waiter::new();
        for (i, candidate) in self.candidates.iter_mut().enumerate() {
            if let Arm::Channel { op, .. } = &mut candidate.arm {
                op.register(&waiter, i);
            }
        }
        Poll::Parked(waiter)
    }

    /// Phase two epilogue: withdraw `waiter` from every candidate channel
    /// and turn its resolution into the winning outcome. Unsent values of
    /// losing send candidates are dropped.
    pub fn complete(
        &mut self,
        waiter: &Arc<Waiter>,
        resolution: Resolution,
    ) -> Result<(usize, Outcome), CoroutineError> {
        for endpoint in self.endpoints() {
            endpoint.withdraw(waiter);
        }
        match resolution {
            Resolution::Won {
                arm,
                value: Some(value),
            } => Ok((arm, Outcome::Received(value))),
            Resolution::Won { arm, value: None } => Ok((arm, Outcome::Sent)),
            Resolution::Cancelled => Err(CoroutineError::Cancelled),
            Resolution::TimedOut => Err(CoroutineError::TimedOut),
        }
    }
}

impl Arm {
    fn from_op(op: Box<dyn ChannelArm>) -> Self {
        let endpoint = op.endpoint();
        Arm::Channel { op, endpoint }
    }
}
