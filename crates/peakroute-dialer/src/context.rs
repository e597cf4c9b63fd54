//! Cancellable operation context
//!
//! An [`OpContext`] carries a cancellation signal and an optional deadline
//! through every outbound operation: dials, proxy handshakes and API calls.
//! Children inherit the parent's cancellation and never extend its deadline.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why an operation run under an [`OpContext`] stopped early
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum Interrupted {
    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded")]
    DeadlineExceeded,
}

#[derive(Debug, Clone)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never cancelled and has no deadline
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A fresh context expiring `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::background().timeout(timeout)
    }

    /// A context cancelled together with `token`
    pub fn from_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Derive a child context that is cancelled whenever this one is
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Tighten the deadline to at most `timeout` from now
    pub fn timeout(mut self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        });
        self
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when there is no deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Drive `fut` until it completes, the context is cancelled or the deadline passes.
    ///
    /// On interruption `fut` is dropped, which releases any socket it had
    /// partially opened.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Interrupted>
    where
        F: Future<Output = T>,
    {
        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(Interrupted::Cancelled),
            _ = deadline => Err(Interrupted::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }
}

impl Default for OpContext {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_run_completes_before_deadline() {
        let ctx = OpContext::with_timeout(Duration::from_secs(5));
        let result = ctx
            .run(async {
                tokio::time::sleep(Duration::from_secs(1)).await;
                42
            })
            .await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_hits_deadline() {
        let ctx = OpContext::with_timeout(Duration::from_secs(1));
        let result = ctx
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(result, Err(Interrupted::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_parent_cancellation_reaches_child() {
        let parent = OpContext::background();
        let child = parent.child();
        parent.cancel();

        assert!(child.is_cancelled());
        let result = child.run(std::future::pending::<()>()).await;
        assert_eq!(result, Err(Interrupted::Cancelled));
    }

    #[tokio::test]
    async fn test_child_cancellation_does_not_reach_parent() {
        let parent = OpContext::background();
        let child = parent.child();
        child.cancel();
        assert!(!parent.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_never_extends_deadline() {
        let ctx = OpContext::with_timeout(Duration::from_secs(1));
        let original = ctx.deadline();
        let widened = ctx.timeout(Duration::from_secs(60));
        assert_eq!(widened.deadline(), original);
    }

    #[test]
    fn test_background_has_no_deadline() {
        let ctx = OpContext::background();
        assert!(ctx.deadline().is_none());
        assert!(ctx.remaining().is_none());
    }
}
