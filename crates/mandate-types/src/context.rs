//! Operation context: deadline + cancellation.
//!
//! Every public operation that may block on I/O or time takes an
//! [`OpContext`]. Exceeding the deadline yields
//! [`Error::DeadlineExceeded`]; cancellation yields [`Error::Cancelled`].
//! Both must be honoured promptly and release held resources.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Carries an operation's cancellation token and optional deadline.
#[derive(Debug, Clone)]
pub struct OpContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl OpContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            cancel: CancellationToken::new(),
            deadline: None,
        }
    }

    /// A context built around an existing cancellation token.
    pub fn with_cancel(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Derive a context whose deadline is `timeout` from now.
    ///
    /// If the context already has an earlier deadline, that one is kept.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing <= candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    /// The underlying cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Request cancellation of everything running under this context.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Time remaining before the deadline, if one is set.
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// Fail fast if the context is already cancelled or past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if matches!(self.remaining(), Some(Duration::ZERO)) {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Run `fut` under this context.
    ///
    /// Resolves to [`Error::Cancelled`] or [`Error::DeadlineExceeded`] as
    /// soon as either condition fires, dropping the future (and thereby
    /// releasing anything it holds).
    pub async fn run<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(Error::Cancelled),
                    _ = tokio::time::sleep_until(deadline.into()) => Err(Error::DeadlineExceeded),
                    out = fut => out,
                }
            }
            None => {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(Error::Cancelled),
                    out = fut => out,
                }
            }
        }
    }

    /// Sleep for `dur`, waking early on cancellation or deadline expiry.
    pub async fn sleep(&self, dur: Duration) -> Result<()> {
        self.run(async {
            tokio::time::sleep(dur).await;
            Ok(())
        })
        .await
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

    #[tokio::test]
    async fn background_runs_to_completion() {
        let cx = OpContext::background();
        let out = cx.run(async { Ok(7) }).await.unwrap();
        assert_eq!(out, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_exceeded_surfaces() {
        let cx = OpContext::background().with_timeout(Duration::from_millis(10));
        let out: Result<()> = cx
            .run(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                Ok(())
            })
            .await;
        assert_eq!(out, Err(Error::DeadlineExceeded));
    }

    #[tokio::test]
    async fn cancellation_wins_over_work() {
        let cx = OpContext::background();
        cx.cancel();
        let out: Result<()> = cx.run(async { Ok(()) }).await;
        assert_eq!(out, Err(Error::Cancelled));
        assert_eq!(cx.check(), Err(Error::Cancelled));
    }

    #[test]
    fn earlier_deadline_is_kept() {
        let cx = OpContext::background().with_timeout(Duration::from_millis(5));
        let widened = cx.with_timeout(Duration::from_secs(60));
        assert!(widened.remaining().unwrap() <= Duration::from_millis(5));
    }
}
