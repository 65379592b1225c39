//! Cancellation and deadlines for driver operations.
//!
//! An [`OpContext`] travels with every operation that may start a
//! subprocess. When it finishes (explicit cancel, parent cancel, or an
//! elapsed deadline) any process group invoked under it is killed.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};

#[derive(Debug, Clone)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

impl OpContext {
    /// A root context that never finishes on its own.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A child that finishes when this context does, or after `timeout`,
    /// whichever comes first.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let deadline = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(match self.deadline {
                Some(parent) => parent.min(deadline),
                None => deadline,
            }),
        }
    }

    /// A child that can be cancelled without affecting this context.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancels the context when the returned guard is dropped.
    pub fn drop_guard(&self) -> DropGuard {
        self.token.clone().drop_guard()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline passes.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    _ = self.token.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timeout_finishes_context() {
        let ctx = OpContext::background().with_timeout(Duration::from_secs(5));
        assert!(!ctx.is_done());
        ctx.done().await;
        assert!(ctx.is_done());
    }

    #[tokio::test(start_paused = true)]
    async fn test_child_keeps_earlier_deadline() {
        let parent = OpContext::background().with_timeout(Duration::from_secs(1));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }

    #[tokio::test]
    async fn test_parent_cancel_reaches_child() {
        let parent = OpContext::background();
        let child = parent.child();
        parent.cancel();
        child.done().await;
        assert!(child.is_done());
    }

    #[tokio::test]
    async fn test_child_cancel_leaves_parent() {
        let parent = OpContext::background();
        let child = parent.child();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[test]
    fn test_drop_guard_cancels() {
        let ctx = OpContext::background();
        {
            let _guard = ctx.drop_guard();
        }
        assert!(ctx.is_done());
    }
}
