//! Cooperative cancellation for runnables.
//!
//! An [`AbortSignal`] is threaded through every nested call via
//! [`RunnableConfig`](crate::runnables::RunnableConfig). Raising it does not
//! preempt anything: every suspension point inside the lifecycle helpers
//! races its work against the signal, so in-flight work is dropped at its
//! next await and the caller sees [`Error::Aborted`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{AbortReason, Error, Result};

/// A cancellation signal shared by a tree of runs.
///
/// Cloning yields a handle to the same signal. Raising it more than once
/// has the same effect as raising it once: the first reason wins.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    token: CancellationToken,
    reason: Arc<Mutex<Option<AbortReason>>>,
    parent: Option<Arc<AbortSignal>>,
}

impl AbortSignal {
    /// Create a signal that has not been raised.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a signal that raises itself after `after`.
    ///
    /// The timer runs on the current tokio runtime and is released as soon
    /// as the signal is raised for any other reason.
    pub fn timeout(after: Duration) -> Self {
        let signal = Self::new();
        signal.raise_after(after);
        signal
    }

    /// Raise the signal with [`AbortReason::Cancelled`].
    pub fn abort(&self) {
        self.abort_with(AbortReason::Cancelled);
    }

    /// Raise the signal with an explicit reason. Later reasons are ignored.
    pub fn abort_with(&self, reason: AbortReason) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.token.cancel();
    }

    /// Whether the signal has been raised.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The reason the signal was raised, if it was.
    pub fn reason(&self) -> Option<AbortReason> {
        if !self.is_aborted() {
            return None;
        }
        let reason = self.reason.lock().clone();
        // A parent signal cancels children without writing their slot.
        reason
            .or_else(|| self.parent.as_ref().and_then(|parent| parent.reason()))
            .or(Some(AbortReason::Cancelled))
    }

    /// Return the abort error if the signal has been raised.
    pub fn check(&self) -> Result<()> {
        match self.reason() {
            Some(reason) => Err(Error::Aborted(reason)),
            None => Ok(()),
        }
    }

    /// Resolve once the signal is raised, returning the matching error.
    pub async fn aborted(&self) -> Error {
        self.token.cancelled().await;
        Error::Aborted(self.reason().unwrap_or(AbortReason::Cancelled))
    }

    /// Derive a signal that is raised when this one is, and can also be
    /// raised on its own without affecting the parent.
    pub fn child(&self) -> Self {
        let child = Self {
            token: self.token.child_token(),
            reason: Arc::new(Mutex::new(None)),
            parent: Some(Arc::new(self.clone())),
        };
        if let Some(reason) = self.reason() {
            child.abort_with(reason);
        }
        child
    }

    /// Derive a child signal that also raises itself after `after`.
    pub fn child_with_timeout(&self, after: Duration) -> Self {
        let child = self.child();
        child.raise_after(after);
        child
    }

    fn raise_after(&self, after: Duration) {
        let signal = self.clone();
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                target: "runnable_core::signal",
                "No tokio runtime available, timeout of {:?} will not be enforced",
                after,
            );
            return;
        };
        handle.spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(after) => signal.abort_with(AbortReason::Timeout(after)),
                _ = signal.token.cancelled() => {}
            }
        });
    }

    /// Race `fut` against this signal.
    ///
    /// Returns the future's own result if it finishes first; otherwise the
    /// future is dropped and [`Error::Aborted`] is returned.
    pub async fn race<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            error = self.aborted() => Err(error),
            result = fut => result,
        }
    }
}

/// Race `fut` against an optional signal.
pub async fn race_with_signal<T, F>(fut: F, signal: Option<&AbortSignal>) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match signal {
        Some(signal) => signal.race(fut).await,
        None => fut.await,
    }
}

/// Sleep for `duration` unless `signal` fires first.
pub async fn sleep_with_signal(duration: Duration, signal: Option<&AbortSignal>) -> Result<()> {
    race_with_signal(
        async {
            tokio::time::sleep(duration).await;
            Ok(())
        },
        signal,
    )
    .await
}
