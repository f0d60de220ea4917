//! Cancellation and deadlines for measurement operations.
//!
//! Every blocking network call in this crate takes a [`Context`]. A context
//! is a [`CancellationToken`] plus an optional deadline; [`Context::run`]
//! races a future against both and maps the loser to the matching
//! [`NetError`] so that the failure vocabulary stays stable.
//!
//! # Usage
//!
//! ```rust,ignore
//! let ctx = Context::new().with_timeout(Duration::from_secs(60));
//! let addrs = ctx.run(resolver.lookup_host(&ctx, "example.com")).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::netx::errorx::NetError;

/// Cancellation token plus optional deadline.
#[derive(Debug, Clone, Default)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl Context {
    /// Create a fresh, never-expiring context.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a context that is already cancelled.
    #[must_use]
    pub fn cancelled() -> Self {
        let ctx = Self::new();
        ctx.cancel();
        ctx
    }

    /// Derive a child context. Cancelling the parent cancels the child; the
    /// child's deadline is the earliest of the parent's and `timeout`.
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

    /// Derive a child context with the same deadline.
    #[must_use]
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Cancel this context and all of its children.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// The deadline, if any.
    #[must_use]
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Returns the error this context would currently produce, if done.
    #[must_use]
    pub fn err(&self) -> Option<NetError> {
        if self.token.is_cancelled() {
            return Some(NetError::Interrupted);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(NetError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Wait until the context is cancelled or expires.
    pub async fn done(&self) -> NetError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                _ = self.token.cancelled() => NetError::Interrupted,
                _ = tokio::time::sleep_until(deadline) => NetError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                NetError::Interrupted
            }
        }
    }

    /// Run `fut` unless the context fires first.
    pub async fn run<T, F>(&self, fut: F) -> Result<T, NetError>
    where
        F: Future<Output = Result<T, NetError>>,
    {
        if let Some(err) = self.err() {
            return Err(err);
        }
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}
