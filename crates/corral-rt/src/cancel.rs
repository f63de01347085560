// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation.
//!
//! AtomicBool flag plus an optional parent. A run's token hangs off its
//! scope's token, so cancelling the scope cancels every run in it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cancellation token shared between a scope and the runs it spawned.
#[derive(Debug, Default)]
pub struct CancelToken {
    flag: AtomicBool,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            parent: None,
        }
    }

    /// Create a token that also reports cancellation of `parent`.
    pub fn child(parent: &Arc<CancelToken>) -> Self {
        Self {
            flag: AtomicBool::new(false),
            parent: Some(parent.clone()),
        }
    }

    /// Set the cancellation flag. Returns false if it was already set.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::AcqRel)
    }

    /// Check if cancellation was requested here or on any ancestor.
    pub fn is_cancelled(&self) -> bool {
        if self.flag.load(Ordering::Acquire) {
            return true;
        }
        self.parent
            .as_ref()
            .map(|p| p.is_cancelled())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_once() {
        let t = CancelToken::new();
        assert!(!t.is_cancelled());
        assert!(t.cancel());
        assert!(!t.cancel());
        assert!(t.is_cancelled());
    }

    #[test]
    fn parent_cancels_child() {
        let parent = Arc::new(CancelToken::new());
        let child = CancelToken::child(&parent);
        assert!(!child.is_cancelled());
        parent.cancel();
        assert!(child.is_cancelled());
    }

    #[test]
    fn child_does_not_cancel_parent() {
        let parent = Arc::new(CancelToken::new());
        let child = CancelToken::child(&parent);
        child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
