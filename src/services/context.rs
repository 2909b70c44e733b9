//! Per-operation cancellation and deadline
//!
//! Every engine entry point takes an [`OpContext`]. Each store or provider
//! call goes through [`OpContext::guard`], so a cancelled or timed-out caller
//! stops at the next suspension point. Work the store already committed
//! stays committed.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::types::{CarelinkError, Result};

#[derive(Debug, Clone, Default)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// Context with no deadline, cancellable through [`OpContext::cancel`]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + timeout),
        }
    }

    /// Context driven by an existing token
    pub fn with_token(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Fail if the caller has gone away
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(CarelinkError::Cancelled);
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                return Err(CarelinkError::DeadlineExceeded);
            }
        }
        Ok(())
    }

    /// Run `fut` unless the context is cancelled or its deadline passes first
    pub async fn guard<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.check()?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(CarelinkError::Cancelled),
            () = deadline => Err(CarelinkError::DeadlineExceeded),
            output = fut => Ok(output),
        }
    }

    /// Sleep for `duration`, waking early on cancellation or deadline
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.guard(tokio::time::sleep(duration)).await
    }
}
