//! Process latch
//!
//! A single-consumer, multi-producer wakeup primitive. `set` is sticky
//! until the owner calls `reset`, and a set that races with a concurrent
//! `wait` is never lost. The required idiom for the owner is
//! reset-then-check-then-wait:
//!
//! ```ignore
//! loop {
//!     latch.reset();
//!     if work_available() {
//!         break;
//!     }
//!     latch.wait().await;
//! }
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Default)]
pub struct Latch {
    set: AtomicBool,
    notify: Notify,
}

impl Latch {
    pub fn new() -> Self {
        Self {
            set: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Set the latch, waking the owner if it is currently waiting.
    pub fn set(&self) {
        self.set.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    /// Clear the latch. Only the owning task should call this.
    pub fn reset(&self) {
        self.set.store(false, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Wait until the latch is set.
    ///
    /// Registration with the notifier happens before the flag check, so a
    /// concurrent `set` either flips the flag we are about to read or wakes
    /// the registered waiter.
    pub async fn wait(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }

    /// Wait until the latch is set or the timeout elapses.
    ///
    /// Returns true if the latch was set.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn set_before_wait_is_not_lost() {
        let latch = Latch::new();
        latch.set();
        latch.wait().await;
        assert!(latch.is_set());
    }

    #[tokio::test]
    async fn set_wakes_concurrent_waiter() {
        let latch = Arc::new(Latch::new());
        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait().await })
        };
        tokio::task::yield_now().await;
        latch.set();
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn wait_timeout_expires_when_unset() {
        let latch = Latch::new();
        assert!(!latch.wait_timeout(Duration::from_millis(10)).await);
        latch.set();
        assert!(latch.wait_timeout(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn reset_clears_the_flag() {
        let latch = Latch::new();
        latch.set();
        latch.reset();
        assert!(!latch.is_set());
    }
}
