//! Cancellation and deadline scope for store calls
//!
//! A [`Context`] travels with every transactional call. It never cancels work
//! on its own; [`crate::store::run_atomic`] races the unit of work against
//! [`Context::done`] and rolls back when the context ends first.

use std::future::pending;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{Instant, sleep_until};

use crate::error::LedgerError;

#[derive(Debug, Clone, Default)]
pub struct Context {
    deadline: Option<Instant>,
    cancel: Option<watch::Receiver<bool>>,
}

/// Cancels every [`Context`] cloned from the one it was created with
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

impl Context {
    /// A context that never ends
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Tightens the deadline; an earlier existing deadline wins
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(current) => current.min(deadline),
            None => deadline,
        });
        self
    }

    /// Attach a cancel signal, replacing any previous one
    pub fn with_cancel(mut self) -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        self.cancel = Some(rx);
        (self, CancelHandle { tx })
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Time left before the deadline, `None` when unbounded
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn is_canceled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// The reason this context ended, if it has
    pub fn err(&self) -> Option<LedgerError> {
        if self.is_canceled() {
            return Some(LedgerError::Canceled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(LedgerError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn check(&self) -> Result<(), LedgerError> {
        match self.err() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Resolves once the context is canceled or its deadline passes
    pub async fn done(&self) -> LedgerError {
        let canceled = async {
            if let Some(rx) = &self.cancel {
                let mut rx = rx.clone();
                if rx.wait_for(|canceled| *canceled).await.is_ok() {
                    return;
                }
            }
            // Sender dropped without canceling: never fires
            pending::<()>().await
        };
        let expired = async {
            match self.deadline {
                Some(deadline) => sleep_until(deadline).await,
                None => pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = canceled => LedgerError::Canceled,
            _ = expired => LedgerError::DeadlineExceeded,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_never_ends() {
        let ctx = Context::background();
        assert!(ctx.err().is_none());
        assert!(ctx.remaining().is_none());
        assert!(ctx.check().is_ok());
    }

    #[tokio::test]
    async fn test_cancel_is_observed_by_clones() {
        let (ctx, handle) = Context::background().with_cancel();
        let clone = ctx.clone();
        assert!(!clone.is_canceled());

        handle.cancel();
        assert_eq!(clone.err(), Some(LedgerError::Canceled));
        assert_eq!(ctx.done().await, LedgerError::Canceled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_fires() {
        let ctx = Context::background().with_timeout(Duration::from_millis(50));
        assert!(ctx.err().is_none());

        assert_eq!(ctx.done().await, LedgerError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(LedgerError::DeadlineExceeded));
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_deadline_wins() {
        let short = Context::background().with_timeout(Duration::from_secs(1));
        let widened = short.clone().with_timeout(Duration::from_secs(60));
        assert_eq!(widened.deadline(), short.deadline());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_handle_does_not_cancel() {
        let (ctx, handle) = Context::background().with_cancel();
        drop(handle);
        let ctx = ctx.with_timeout(Duration::from_millis(10));
        assert_eq!(ctx.done().await, LedgerError::DeadlineExceeded);
    }
}
