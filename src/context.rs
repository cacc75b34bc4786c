//! Per-call cancellation and deadline context
//!
//! Every cloud operation takes an [`OpContext`]. Provider calls and poll
//! sleeps race against the context so a cancelled or expired caller never
//! keeps a loop running.

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Cancellation token plus optional deadline for one top-level call
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// Context that is never cancelled and has no deadline
    pub fn new() -> Self {
        Self::default()
    }

    /// Context bound to an externally owned cancellation token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            deadline: None,
        }
    }

    /// Set an absolute deadline
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) => existing.min(deadline),
            None => deadline,
        });
        self
    }

    /// Set a deadline relative to now
    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Cancel this context and every clone of it
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Fail if the context is already cancelled or past its deadline
    pub fn check(&self, operation: &str) -> Result<()> {
        if self.token.is_cancelled() {
            return Err(Error::Cancelled {
                operation: operation.to_string(),
            });
        }
        if matches!(self.deadline, Some(deadline) if Instant::now() >= deadline) {
            return Err(Error::DeadlineExceeded {
                operation: operation.to_string(),
            });
        }
        Ok(())
    }

    /// Drive `fut` to completion unless the context ends first
    pub async fn run<F, T>(&self, operation: &str, fut: F) -> Result<T>
    where
        F: Future<Output = T>,
    {
        self.check(operation)?;

        let deadline = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            output = fut => Ok(output),
            _ = self.token.cancelled() => Err(Error::Cancelled {
                operation: operation.to_string(),
            }),
            _ = deadline => Err(Error::DeadlineExceeded {
                operation: operation.to_string(),
            }),
        }
    }

    /// Sleep for `duration`, waking early with an error if the context ends
    pub async fn sleep(&self, operation: &str, duration: Duration) -> Result<()> {
        self.run(operation, tokio::time::sleep(duration)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes_without_deadline() {
        let ctx = OpContext::new();
        tokio_test::assert_ok!(ctx.sleep("nap", Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_interrupts_sleep() {
        let ctx = OpContext::new().with_timeout(Duration::from_secs(2));
        let started = Instant::now();

        let err = ctx.sleep("nap", Duration::from_secs(30)).await.unwrap_err();

        assert_matches!(err, Error::DeadlineExceeded { .. });
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_run() {
        let ctx = OpContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            canceller.cancel();
        });

        let err = ctx
            .run("describe", std::future::pending::<()>())
            .await
            .unwrap_err();
        assert_matches!(err, Error::Cancelled { operation } if operation == "describe");
    }

    #[tokio::test(start_paused = true)]
    async fn test_nearest_deadline_wins() {
        let near = Instant::now() + Duration::from_secs(1);
        let far = Instant::now() + Duration::from_secs(100);
        let ctx = OpContext::new().with_deadline(near).with_deadline(far);
        assert_eq!(ctx.deadline(), Some(near));
    }

    #[test]
    fn test_check_after_cancel() {
        let ctx = OpContext::new();
        ctx.cancel();
        assert_matches!(ctx.check("x"), Err(Error::Cancelled { .. }));
    }
}
