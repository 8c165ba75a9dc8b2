use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// Cancellation scope passed to every blocking operation.
///
/// A context is done once its token (or any ancestor's) is cancelled or its
/// deadline has passed. Children inherit the tighter of the two deadlines.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl Context {
    /// A context that is never done unless cancelled explicitly.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
        }
    }

    #[must_use]
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.token.is_cancelled() || self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Resolves once the context is cancelled or its deadline expires.
    pub async fn done(&self) {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    () = self.token.cancelled() => {}
                    () = tokio::time::sleep_until(deadline) => {}
                }
            }
            None => self.token.cancelled().await,
        }
    }

    /// Drive `fut` to completion unless the context finishes first, in which
    /// case `fut` is dropped.
    pub async fn run<F: Future>(&self, fut: F) -> Result<F::Output, Cancelled> {
        if self.is_done() {
            return Err(Cancelled);
        }
        tokio::select! {
            biased;
            () = self.done() => Err(Cancelled),
            out = fut => Ok(out),
        }
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_done() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn background_runs_to_completion() {
        let ctx = Context::background();
        let out = ctx.run(async { 7 }).await;
        assert_eq!(out, Ok(7));
        assert!(!ctx.is_done());
    }

    #[tokio::test]
    async fn cancel_propagates_to_children() {
        let parent = Context::background();
        let child = parent.with_cancel();
        parent.cancel();
        assert!(child.is_done());
        assert_eq!(child.run(std::future::pending::<()>()).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn child_cancel_does_not_touch_parent() {
        let parent = Context::background();
        let child = parent.with_cancel();
        child.cancel();
        assert!(child.is_done());
        assert!(!parent.is_done());
    }

    #[tokio::test]
    async fn timeout_expires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        let out = ctx
            .run(tokio::time::sleep(Duration::from_secs(10)))
            .await;
        assert_eq!(out, Err(Cancelled));
        assert!(ctx.is_done());
    }

    #[tokio::test]
    async fn child_keeps_tighter_deadline() {
        let parent = Context::background().with_timeout(Duration::from_millis(10));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());
    }
}
