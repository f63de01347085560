// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Coroutine templates.
//!
//! A coroutine is an immutable chain of steps. It holds no run state, so
//! the same template can be run any number of times, concurrently, in any
//! scope.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::step::{Step, StepNode};

/// A chain of steps taking `I` and producing `O`.
pub struct Coroutine<I, O> {
    name: Arc<str>,
    steps: Arc<[StepNode]>,
    _type: PhantomData<fn(I) -> O>,
}

impl<I, O> Clone for Coroutine<I, O> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            steps: self.steps.clone(),
            _type: PhantomData,
        }
    }
}

impl<I, O> fmt::Debug for Coroutine<I, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Coroutine")
            .field("name", &self.name)
            .field("steps", &self.steps)
            .finish()
    }
}

/// Start a coroutine with `step`.
pub fn first<I, O>(step: impl Into<Step<I, O>>) -> Coroutine<I, O> {
    Coroutine::first(step)
}

impl<I, O> Coroutine<I, O> {
    pub fn first(step: impl Into<Step<I, O>>) -> Self {
        let node = step.into().into_node();
        Self {
            name: node.label.clone(),
            steps: Arc::from(vec![node]),
            _type: PhantomData,
        }
    }

    /// Append `step`, feeding it this coroutine's output.
    pub fn then<P>(self, step: impl Into<Step<O, P>>) -> Coroutine<I, P> {
        let mut steps = self.steps.to_vec();
        steps.push(step.into().into_node());
        Coroutine {
            name: self.name,
            steps: steps.into(),
            _type: PhantomData,
        }
    }

    /// Name used in logs and on continuations. Defaults to the label of
    /// the first step.
    pub fn with_name(mut self, name: impl Into<Arc<str>>) -> Self {
        self.name = name.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn name_arc(&self) -> Arc<str> {
        self.name.clone()
    }

    pub(crate) fn steps(&self) -> Arc<[StepNode]> {
        self.steps.clone()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Labels of the steps, in execution order.
    pub fn step_labels(&self) -> Vec<&str> {
        self.steps.iter().map(|s| &*s.label).collect()
    }
}
