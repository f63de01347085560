// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Steps: the building blocks of a coroutine.
//!
//! A step takes the current value and produces the next one. The set of
//! step kinds is closed: channel receive, channel send, a plain function,
//! and a select over other steps. `Step<I, O>` is the typed face the
//! builders hand out; the driver only sees the erased [`StepNode`].
//!
//! Channel steps name their channel by id. The channel itself is looked up
//! in the running scope's context when the step executes, so one coroutine
//! template can run in many scopes.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::channel::ChannelId;
use crate::context::Context;
use crate::select::{receive_arm, send_arm, ChannelArm};
use crate::waiter::Value;

/// Why a step could not produce its output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StepFault {
    Error(String),
    TypeMismatch,
}

pub(crate) type ApplyFn = Arc<dyn Fn(Value) -> Result<Value, StepFault> + Send + Sync>;
pub(crate) type BindReceive = Arc<dyn Fn(&Context) -> Box<dyn ChannelArm> + Send + Sync>;
pub(crate) type BindSend =
    Arc<dyn Fn(&Context, &Value) -> Result<Box<dyn ChannelArm>, StepFault> + Send + Sync>;

#[derive(Clone)]
pub(crate) enum StepKind {
    Receive(BindReceive),
    Send(BindSend),
    Apply(ApplyFn),
    /// Candidates in declaration order. Never nested.
    Select(Vec<StepNode>),
}

/// Erased step with a label used in logs and errors.
#[derive(Clone)]
pub(crate) struct StepNode {
    pub label: Arc<str>,
    pub kind: StepKind,
}

impl StepNode {
    /// True if executing this step may park the run.
    pub fn suspends(&self) -> bool {
        !matches!(self.kind, StepKind::Apply(_))
    }
}

impl fmt::Debug for StepNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// A typed step from `I` to `O`.
pub struct Step<I, O> {
    node: StepNode,
    _type: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for Step<I, O> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            _type: PhantomData,
        }
    }
}

impl<I, O> fmt::Debug for Step<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Step({})", self.node.label)
    }
}

impl<I, O> Step<I, O> {
    pub(crate) fn from_node(node: StepNode) -> Self {
        Self {
            node,
            _type: PhantomData,
        }
    }

    fn new(label: impl Into<Arc<str>>, kind: StepKind) -> Self {
        Self::from_node(StepNode {
            label: label.into(),
            kind,
        })
    }

    pub(crate) fn into_node(self) -> StepNode {
        self.node
    }

    pub fn label(&self) -> &str {
        &self.node.label
    }

    /// Replace the label shown in logs and error reports.
    pub fn named(mut self, label: impl Into<Arc<str>>) -> Self {
        self.node.label = label.into();
        self
    }

    /// True if this step can park the run (channel and select steps).
    pub fn suspends(&self) -> bool {
        self.node.suspends()
    }
}

/// Receive one value from the channel `id`. The input is discarded.
pub fn receive<I, T: Send + 'static>(id: &ChannelId<T>) -> Step<I, T> {
    let label = format!("receive({})", id);
    let id = id.clone();
    Step::new(
        label,
        StepKind::Receive(Arc::new(move |ctx: &Context| {
            receive_arm(ctx.get_channel(&id))
        })),
    )
}

/// Send a clone of the input on `id` and pass the input through.
pub fn send<T: Clone + Send + 'static>(id: &ChannelId<T>) -> Step<T, T> {
    let label = format!("send({})", id);
    let id = id.clone();
    Step::new(
        label,
        StepKind::Send(Arc::new(move |ctx: &Context, input: &Value| {
            let value = input
                .downcast_ref::<T>()
                .cloned()
                .ok_or(StepFault::TypeMismatch)?;
            Ok(send_arm(ctx.get_channel(&id), value))
        })),
    )
}

/// Send the value `supplier` derives from the input on `id`, and pass the
/// input through.
pub fn send_with<I, T, F>(id: &ChannelId<T>, supplier: F) -> Step<I, I>
where
    I: 'static,
    T: Send + 'static,
    F: Fn(&I) -> T + Send + Sync + 'static,
{
    let label = format!("send({})", id);
    let id = id.clone();
    Step::new(
        label,
        StepKind::Send(Arc::new(move |ctx: &Context, input: &Value| {
            let input = input.downcast_ref::<I>().ok_or(StepFault::TypeMismatch)?;
            Ok(send_arm(ctx.get_channel(&id), supplier(input)))
        })),
    )
}

/// Transform the input with `f`.
pub fn apply<I, O, F>(f: F) -> Step<I, O>
where
    I: 'static,
    O: Send + 'static,
    F: Fn(I) -> O + Send + Sync + 'static,
{
    Step::new(
        "apply",
        StepKind::Apply(Arc::new(move |input: Value| {
            let input = input.downcast::<I>().map_err(|_| StepFault::TypeMismatch)?;
            Ok(Box::new(f(*input)) as Value)
        })),
    )
}

/// Transform the input with a fallible `f`. An `Err` fails the run.
pub fn try_apply<I, O, E, F>(f: F) -> Step<I, O>
where
    I: 'static,
    O: Send + 'static,
    E: fmt::Display,
    F: Fn(I) -> Result<O, E> + Send + Sync + 'static,
{
    Step::new(
        "try_apply",
        StepKind::Apply(Arc::new(move |input: Value| {
            let input = input.downcast::<I>().map_err(|_| StepFault::TypeMismatch)?;
            match f(*input) {
                Ok(out) => Ok(Box::new(out) as Value),
                Err(e) => Err(StepFault::Error(e.to_string())),
            }
        })),
    )
}

/// Produce a value from `f`, ignoring the input.
pub fn supply<I, O, F>(f: F) -> Step<I, O>
where
    O: Send + 'static,
    F: Fn() -> O + Send + Sync + 'static,
{
    Step::new(
        "supply",
        StepKind::Apply(Arc::new(move |_input: Value| Ok(Box::new(f()) as Value))),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{int_channel, string_channel};

    fn run_apply(step: &Step<i64, String>, input: i64) -> Result<Value, StepFault> {
        match &step.node.kind {
            StepKind::Apply(f) => f(Box::new(input)),
            _ => panic!("not an apply step"),
        }
    }

    #[test]
    fn labels_name_the_channel() {
        let r: Step<(), String> = receive(&string_channel("A"));
        assert_eq!(r.label(), "receive(A)");
        assert!(r.suspends());
        let s = send(&int_channel("n"));
        assert_eq!(s.label(), "send(n)");
        let a: Step<i64, i64> = apply(|x: i64| x + 1);
        assert!(!a.suspends());
        assert_eq!(a.named("inc").label(), "inc");
    }

    #[test]
    fn apply_transforms_value() {
        let step: Step<i64, String> = apply(|x: i64| format!("n={}", x));
        let out = run_apply(&step, 4).unwrap();
        assert_eq!(*out.downcast::<String>().unwrap(), "n=4");
    }

    #[test]
    fn try_apply_reports_error() {
        let step: Step<i64, String> = try_apply(|x: i64| {
            if x < 0 {
                Err(format!("negative: {}", x))
            } else {
                Ok(x.to_string())
            }
        });
        assert_eq!(
            run_apply(&step, -1).err(),
            Some(StepFault::Error("negative: -1".into()))
        );
        assert!(run_apply(&step, 1).is_ok());
    }

    #[test]
    fn apply_rejects_foreign_input() {
        let step: Step<i64, i64> = apply(|x: i64| x);
        let StepKind::Apply(f) = &step.node.kind else {
            panic!("not an apply step")
        };
        assert_eq!(f(Box::new("text")).err(), Some(StepFault::TypeMismatch));
    }

    #[test]
    fn send_binds_channel_from_context() {
        let ctx = Context::new();
        let id = int_channel("out");
        let step = send(&id);
        let StepKind::Send(bind) = &step.node.kind else {
            panic!("not a send step")
        };
        let input: Value = Box::new(9i64);
        assert!(bind(&ctx, &input).is_ok());
        assert!(ctx.has_channel(&id));
        assert_eq!(bind(&ctx, &(Box::new("x") as Value)).err().map(|_| ()), Some(()));
    }
}
