//! Progress object handed to API callers for each Source/Target operation.
//!
//! Exactly one progress object exists per operation. It completes once, with
//! either success, cancellation, or a translated error; later completions are
//! ignored so the first terminal state wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use uuid::Uuid;

use crate::error::GuestRc;

/// Terminal state of an operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressOutcome {
    /// Transfer finished
    Success,
    /// Cancelled by host or guest; not an error
    Cancelled,
    /// Failed with a status code and translated message
    Failed {
        /// Status code
        rc: GuestRc,
        /// Human-readable message
        message: String,
    },
}

/// Point-in-time view of a progress object
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Percentage 0..=100
    pub percent: u8,
    /// Terminal state, once reached
    pub outcome: Option<ProgressOutcome>,
}

impl ProgressSnapshot {
    /// Check if a terminal state was reached
    pub fn is_completed(&self) -> bool {
        self.outcome.is_some()
    }
}

/// Operation progress
#[derive(Debug)]
pub struct Progress {
    id: Uuid,
    description: String,
    state: watch::Sender<ProgressSnapshot>,
    cancel_requested: AtomicBool,
}

impl Progress {
    /// Create a fresh progress object
    pub fn new(description: impl Into<String>) -> Arc<Self> {
        let (state, _) = watch::channel(ProgressSnapshot::default());
        Arc::new(Self {
            id: Uuid::new_v4(),
            description: description.into(),
            state,
            cancel_requested: AtomicBool::new(false),
        })
    }

    /// Unique ID
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Operation description
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Current snapshot
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.borrow().clone()
    }

    /// Current percentage
    pub fn percent(&self) -> u8 {
        self.state.borrow().percent
    }

    /// Check if a terminal state was reached
    pub fn is_completed(&self) -> bool {
        self.state.borrow().is_completed()
    }

    /// Terminal state, if reached
    pub fn outcome(&self) -> Option<ProgressOutcome> {
        self.state.borrow().outcome.clone()
    }

    /// Raise the percentage. Never lowers it and has no effect once completed.
    pub fn set_percent(&self, percent: u8) {
        let percent = percent.min(100);
        self.state.send_if_modified(|s| {
            if s.outcome.is_some() || percent <= s.percent {
                return false;
            }
            s.percent = percent;
            true
        });
    }

    /// Move to a terminal state at 100%. Returns false if already completed.
    pub fn complete(&self, outcome: ProgressOutcome) -> bool {
        self.state.send_if_modified(|s| {
            if s.outcome.is_some() {
                return false;
            }
            tracing::debug!(progress = %self.id, ?outcome, "progress completed");
            s.percent = 100;
            s.outcome = Some(outcome);
            true
        })
    }

    /// Request cancellation. Returns true on the first request only.
    pub fn cancel(&self) -> bool {
        !self.cancel_requested.swap(true, Ordering::SeqCst)
    }

    /// Check whether cancellation was requested
    pub fn is_cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    /// Wait until a terminal state is reached
    pub async fn wait(&self) -> ProgressOutcome {
        let mut rx = self.state.subscribe();
        loop {
            if let Some(outcome) = rx.borrow_and_update().outcome.clone() {
                return outcome;
            }
            if rx.changed().await.is_err() {
                // Sender lives in self, so this only happens during teardown.
                return self.outcome().unwrap_or(ProgressOutcome::Cancelled);
            }
        }
    }

    /// Wait for a terminal state with a timeout
    pub async fn wait_timeout(&self, timeout: Duration) -> Option<ProgressOutcome> {
        tokio::time::timeout(timeout, self.wait()).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percent_is_monotonic() {
        let progress = Progress::new("test");
        progress.set_percent(40);
        progress.set_percent(20);
        assert_eq!(progress.percent(), 40);
        progress.set_percent(250);
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn test_first_completion_wins() {
        let progress = Progress::new("test");
        assert!(progress.complete(ProgressOutcome::Cancelled));
        assert!(!progress.complete(ProgressOutcome::Success));
        assert_eq!(progress.outcome(), Some(ProgressOutcome::Cancelled));
        assert_eq!(progress.percent(), 100);
    }

    #[test]
    fn test_wait_after_completion() {
        let progress = Progress::new("test");
        progress.complete(ProgressOutcome::Failed {
            rc: GuestRc::TIMEOUT,
            message: "late".to_string(),
        });
        let outcome = tokio_test::block_on(progress.wait());
        assert!(matches!(outcome, ProgressOutcome::Failed { rc, .. } if rc == GuestRc::TIMEOUT));
    }

    #[test]
    fn test_cancel_once() {
        let progress = Progress::new("test");
        assert!(progress.cancel());
        assert!(!progress.cancel());
        assert!(progress.is_cancel_requested());
    }

    #[tokio::test]
    async fn test_wait_returns_outcome() {
        let progress = Progress::new("test");
        let waiter = {
            let progress = progress.clone();
            tokio::spawn(async move { progress.wait().await })
        };
        progress.complete(ProgressOutcome::Success);
        assert_eq!(waiter.await.unwrap(), ProgressOutcome::Success);
    }

    #[tokio::test]
    async fn test_wait_timeout_elapses() {
        let progress = Progress::new("test");
        assert!(progress
            .wait_timeout(Duration::from_millis(20))
            .await
            .is_none());
    }
}
