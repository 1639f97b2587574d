//! Completion latch for one replicated write.
//!
//! Workers report one boolean outcome each; the waiter is released once
//! `target` outcomes have arrived. The aggregate is the AND of the reported
//! outcomes and is frozen at release. Outcomes arriving after release are
//! discarded.

use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

use crate::error::{ReplError, Result};

#[derive(Debug)]
struct LatchState {
    outstanding: usize,
    aggregate_success: bool,
    released: bool,
}

/// One-shot counting barrier.
#[derive(Debug)]
pub struct CompletionLatch {
    target: usize,
    state: Mutex<LatchState>,
    released: watch::Sender<bool>,
}

impl CompletionLatch {
    /// Create a latch waiting for `target` outcomes. A target of 0 starts released.
    pub fn new(target: usize) -> Self {
        let (released, _) = watch::channel(target == 0);
        Self {
            target,
            state: Mutex::new(LatchState {
                outstanding: target,
                aggregate_success: true,
                released: target == 0,
            }),
            released,
        }
    }

    /// Number of outcomes that release the latch.
    pub fn target(&self) -> usize {
        self.target
    }

    /// Record one worker's outcome.
    ///
    /// Returns `false` when the outcome was discarded because the latch had
    /// already released.
    pub fn report_outcome(&self, success: bool) -> bool {
        let mut state = self.state.lock();
        if state.released {
            debug!(success, "discarding outcome reported after release");
            return false;
        }

        state.outstanding -= 1;
        state.aggregate_success &= success;

        if state.outstanding == 0 {
            state.released = true;
            self.released.send_replace(true);
        }
        true
    }

    /// Whether the target count has been reached.
    pub fn is_released(&self) -> bool {
        self.state.lock().released
    }

    /// Outcomes still missing before release.
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }

    /// Wait until released and return the aggregate outcome.
    ///
    /// A latch with target 0 returns immediately. Fails with
    /// [`ReplError::Timeout`] if the target is not reached within `timeout`.
    pub async fn wait(&self, timeout: Duration) -> Result<bool> {
        if self.target == 0 {
            return Ok(self.state.lock().aggregate_success);
        }

        let mut rx = self.released.subscribe();
        let released = async { rx.wait_for(|released| *released).await.map(|_| ()) };
        match tokio::time::timeout(timeout, released).await {
            Ok(Ok(_)) => Ok(self.state.lock().aggregate_success),
            Ok(Err(_)) => Err(ReplError::Shutdown),
            Err(_) => Err(ReplError::Timeout {
                waited_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_zero_target_returns_immediately() {
        let latch = CompletionLatch::new(0);
        assert!(latch.is_released());
        assert!(latch.wait(Duration::from_millis(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_releases_after_target_outcomes() {
        let latch = CompletionLatch::new(2);
        assert!(latch.report_outcome(true));
        assert!(!latch.is_released());
        assert!(latch.report_outcome(true));
        assert!(latch.is_released());
        assert!(latch.wait(Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_aggregate_is_and_of_outcomes() {
        let latch = CompletionLatch::new(3);
        latch.report_outcome(true);
        latch.report_outcome(false);
        latch.report_outcome(true);
        assert!(!latch.wait(Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_late_outcomes_are_discarded() {
        let latch = CompletionLatch::new(1);
        assert!(latch.report_outcome(true));
        assert!(!latch.report_outcome(false));
        assert_eq!(latch.outstanding(), 0);
        assert!(latch.wait(Duration::from_millis(10)).await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let latch = CompletionLatch::new(2);
        latch.report_outcome(true);
        let result = latch.wait(Duration::from_millis(20)).await;
        assert!(matches!(result, Err(ReplError::Timeout { waited_ms: 20 })));
    }

    #[tokio::test]
    async fn test_concurrent_reporters_release_waiter() {
        let latch = Arc::new(CompletionLatch::new(8));

        let waiter = {
            let latch = latch.clone();
            tokio::spawn(async move { latch.wait(Duration::from_secs(5)).await })
        };

        let mut reporters = Vec::new();
        for _ in 0..8 {
            let latch = latch.clone();
            reporters.push(tokio::spawn(async move {
                tokio::task::yield_now().await;
                latch.report_outcome(true)
            }));
        }
        for reporter in reporters {
            assert!(reporter.await.unwrap());
        }

        assert!(waiter.await.unwrap().unwrap());
        assert_eq!(latch.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_multiple_waiters_see_same_result() {
        let latch = Arc::new(CompletionLatch::new(1));
        let mut waiters = Vec::new();
        for _ in 0..3 {
            let latch = latch.clone();
            waiters.push(tokio::spawn(async move { latch.wait(Duration::from_secs(5)).await }));
        }
        tokio::task::yield_now().await;
        latch.report_outcome(false);
        for waiter in waiters {
            assert!(!waiter.await.unwrap().unwrap());
        }
    }
}
