//! Per-operation cancellation and deadlines
//!
//! Every I/O operation takes an [`OpContext`]. Waits race the operation
//! against [`OpContext::done`] so cancellation is seen promptly.

use crate::error::{Result, UplinkError};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Context cancelled together with this one, keeping its deadline
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
        }
    }

    /// Child whose deadline is the earlier of the parent's and `timeout`
    pub fn child_with_timeout(&self, timeout: Duration) -> Self {
        let own = Instant::now() + timeout;
        Self {
            token: self.token.child_token(),
            deadline: Some(self.deadline.map_or(own, |parent| parent.min(own))),
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_done(&self) -> bool {
        self.error().is_some()
    }

    /// Why the context is done, if it is
    pub fn error(&self) -> Option<UplinkError> {
        if self.token.is_cancelled() {
            Some(UplinkError::Cancelled)
        } else if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(UplinkError::DeadlineExceeded)
        } else {
            None
        }
    }

    /// Fail fast when already done
    pub fn check(&self) -> Result<()> {
        match self.error() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Resolves once cancelled or past the deadline
    pub async fn done(&self) -> UplinkError {
        match self.deadline {
            Some(deadline) => tokio::select! {
                biased;
                _ = self.token.cancelled() => UplinkError::Cancelled,
                _ = tokio::time::sleep_until(deadline) => UplinkError::DeadlineExceeded,
            },
            None => {
                self.token.cancelled().await;
                UplinkError::Cancelled
            }
        }
    }

    /// Run `fut` unless the context finishes first
    pub async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            err = self.done() => Err(err),
            res = fut => res,
        }
    }
}
