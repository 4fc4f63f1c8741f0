//! Set-once readiness signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

/// Fires at most once; waiters that arrive late still see it.
#[derive(Debug, Default)]
pub struct ReadySignal {
    set: AtomicBool,
    notify: Notify,
}

impl ReadySignal {
    /// Create an unset signal
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the signal. Returns `false` if it was already set.
    pub fn fire(&self) -> bool {
        if self.set.swap(true, Ordering::AcqRel) {
            return false;
        }
        // notify_one stores a permit if nobody is waiting yet
        self.notify.notify_one();
        self.notify.notify_waiters();
        true
    }

    /// Whether the signal has fired
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Wait until the signal fires
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Wait up to `timeout`; returns whether the signal fired
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}
