//! Concurrent execution of frozen graphs.
//!
//! One cooperative scheduler task per run owns all graph bookkeeping; units
//! execute in parallel on a [`tokio::task::JoinSet`] bounded by the
//! configured concurrency. See [`scheduler::Scheduler`].

pub mod scheduler;

pub use scheduler::SchedulerError;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Cooperative cancellation signal for a run.
///
/// Cloning shares the signal. Cancelling stops the scheduler from
/// dispatching new units, requests best-effort aborts of in-flight ones,
/// and preserves completed and cached results.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

#[derive(Debug, Default)]
struct CancelInner {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.inner.flag.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.flag.load(Ordering::SeqCst)
    }

    /// Resolves once the token is cancelled.
    pub(crate) async fn cancelled(&self) {
        loop {
            if self.is_cancelled() {
                return;
            }
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}
