//! One-shot broadcast signal.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::Notify;

/// A one-shot latch observable by any number of waiters.
///
/// Once triggered, a signal stays triggered: `wait()` resolves immediately
/// and `is_set()` returns true forever after.
#[derive(Default)]
pub struct Signal {
    set: AtomicBool,
    notify: Notify,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Latch the signal and wake all waiters.
    ///
    /// Returns true if this call was the one that latched it.
    pub fn trigger(&self) -> bool {
        let first = !self.set.swap(true, Ordering::SeqCst);
        if first {
            self.notify.notify_waiters();
        }
        first
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Wait until the signal is triggered.
    pub async fn wait(&self) {
        loop {
            // Register interest before the check so a trigger between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signal").field("set", &self.is_set()).finish()
    }
}
