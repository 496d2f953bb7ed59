//! Cancellable, deadline-bearing execution context.
//!
//! Every network and subprocess operation takes a [`RequestContext`]. Cancelling
//! the context aborts the in-flight operation with [`Error::Cancelled`]; an
//! elapsed deadline aborts it with [`Error::Timeout`].

use crate::error::{Error, Result};
use std::future::Future;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Execution context passed to every client operation.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// A context with no deadline that is never cancelled unless asked to.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context driven by an existing cancellation token.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: token,
            deadline: None,
        }
    }

    /// Tighten the deadline to at most `timeout` from now.
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tighten the deadline. An earlier existing deadline wins.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    /// Apply `timeout` only when the caller set no deadline.
    pub fn with_default_deadline(self, timeout: Duration) -> Self {
        if self.has_deadline() {
            self
        } else {
            self.with_timeout(timeout)
        }
    }

    /// A derived context: cancelled with its parent, same deadline.
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            deadline: self.deadline,
        }
    }

    /// Current deadline, if any.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Whether a deadline is set.
    pub fn has_deadline(&self) -> bool {
        self.deadline.is_some()
    }

    /// Cancel this context and all children.
    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    /// Whether the context was cancelled or its deadline passed.
    pub fn is_done(&self) -> bool {
        self.cancellation.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Whether the context was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// The underlying cancellation token.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancellation
    }

    /// Drive `fut` to completion unless the context ends first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.cancellation.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => {
                    tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await
                },
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancellation.cancelled() => Err(Error::Cancelled),
            _ = deadline => Err(Error::Timeout),
            result = fut => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_returns_future_output() {
        let ctx = RequestContext::background();
        let value = ctx.run(async { Ok(42) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn cancelled_context_short_circuits() {
        let ctx = RequestContext::background();
        ctx.cancel();
        let result = ctx.run(async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn deadline_aborts_pending_future() {
        let ctx = RequestContext::background().with_timeout(Duration::from_millis(20));
        let result: Result<()> = ctx.run(std::future::pending()).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[test]
    fn default_deadline_does_not_override_caller_deadline() {
        let ctx = RequestContext::background().with_timeout(Duration::from_secs(1));
        let original = ctx.deadline().unwrap();
        let ctx = ctx.with_default_deadline(Duration::from_secs(60));
        assert_eq!(ctx.deadline(), Some(original));
    }

    #[test]
    fn child_is_cancelled_with_parent() {
        let parent = RequestContext::background();
        let child = parent.child();
        parent.cancel();
        assert!(child.is_cancelled());
    }
}
