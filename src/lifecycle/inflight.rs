//! In-flight dispatch tracking.
//!
//! # Responsibilities
//! - Count shadow dispatches that have not reached `Done`
//! - Let shutdown and tests wait until every dispatch has settled
//!
//! # Design Decisions
//! - Count is decremented by a guard's `Drop`, so a panicking dispatch still
//!   settles
//! - Waiters are woken when the count drops to zero, no polling

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

#[derive(Debug, Default)]
struct Inner {
    count: AtomicU64,
    idle: Notify,
}

/// Tracks dispatches still running for graceful shutdown.
#[derive(Debug, Clone, Default)]
pub struct InFlight {
    inner: Arc<Inner>,
}

impl InFlight {
    /// Create a new tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new dispatch. Returns a guard that decrements on drop.
    pub fn track(&self) -> InFlightGuard {
        self.inner.count.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current number of dispatches in flight.
    pub fn count(&self) -> u64 {
        self.inner.count.load(Ordering::SeqCst)
    }

    /// Wait until no dispatch is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Guard that tracks one dispatch's lifetime.
/// Decrements the in-flight count when dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    inner: Arc<Inner>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.inner.count.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tracker_counts() {
        let tracker = InFlight::new();
        assert_eq!(tracker.count(), 0);

        let guard1 = tracker.track();
        let guard2 = tracker.track();
        assert_eq!(tracker.count(), 2);

        drop(guard1);
        assert_eq!(tracker.count(), 1);
        drop(guard2);
        assert_eq!(tracker.count(), 0);
    }

    #[tokio::test]
    async fn test_wait_idle_returns_immediately_when_empty() {
        let tracker = InFlight::new();
        tokio::time::timeout(Duration::from_millis(100), tracker.wait_idle())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_idle_wakes_on_last_guard() {
        let tracker = InFlight::new();
        let guard = tracker.track();

        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_guard_released_on_panic() {
        let tracker = InFlight::new();
        let guard = tracker.track();
        let task = tokio::spawn(async move {
            let _guard = guard;
            panic!("dispatch failed");
        });
        assert!(task.await.is_err());
        assert_eq!(tracker.count(), 0);
    }
}
