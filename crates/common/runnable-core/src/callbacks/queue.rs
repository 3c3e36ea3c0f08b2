//! Background delivery queue for fire-and-forget callback handlers.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore, oneshot};

/// Number of background jobs the process-wide queue runs at once.
///
/// A single worker keeps every handler's events in the order they were
/// dispatched.
pub const GLOBAL_QUEUE_CONCURRENCY: usize = 1;

static GLOBAL_QUEUE: LazyLock<Arc<CallbackQueue>> =
    LazyLock::new(|| Arc::new(CallbackQueue::new(GLOBAL_QUEUE_CONCURRENCY)));

/// A FIFO queue of background jobs.
///
/// Jobs start in the order they were enqueued and at most `concurrency` of
/// them run at once. The queue counts jobs that have not settled yet;
/// [`drain`](Self::drain) resolves when that count reaches zero.
#[derive(Debug)]
pub struct CallbackQueue {
    permits: Arc<Semaphore>,
    tail: Mutex<Option<oneshot::Receiver<()>>>,
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl CallbackQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            tail: Mutex::new(None),
            pending: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    /// The process-wide queue used by callback dispatch.
    pub fn global() -> Arc<CallbackQueue> {
        GLOBAL_QUEUE.clone()
    }

    /// Number of jobs enqueued and not yet settled.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// Schedule `job` on the current tokio runtime.
    ///
    /// A job that panics is logged and counted as settled. Without a
    /// runtime the job is dropped with a warning.
    pub fn enqueue<F>(&self, label: impl Into<String>, job: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let label = label.into();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(
                target: "runnable_core::callbacks",
                "No tokio runtime available, dropping background callback {}",
                label,
            );
            return;
        };

        let (started_tx, started_rx) = oneshot::channel();
        let previous = self.tail.lock().replace(started_rx);
        self.pending.fetch_add(1, Ordering::SeqCst);
        let settled = Settled {
            pending: self.pending.clone(),
            idle: self.idle.clone(),
        };
        let permits = self.permits.clone();

        runtime.spawn(async move {
            let _settled = settled;
            if let Some(previous) = previous {
                // Resolves with an error when the previous job was dropped.
                let _ = previous.await;
            }
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let _ = started_tx.send(());
            if std::panic::AssertUnwindSafe(job).catch_unwind().await.is_err() {
                tracing::warn!(
                    target: "runnable_core::callbacks",
                    "Background callback {} panicked",
                    label,
                );
            }
        });
    }

    /// Wait until every job enqueued so far, and any enqueued while
    /// waiting, has settled.
    pub async fn drain(&self) {
        loop {
            let notified = self.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.pending() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Marks a job as settled when dropped, including when its runtime shuts
/// down before the job runs.
struct Settled {
    pending: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for Settled {
    fn drop(&mut self) {
        if self.pending.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// Wait for every background callback in the process to settle.
pub async fn await_all_callbacks() {
    GLOBAL_QUEUE.drain().await;
}
