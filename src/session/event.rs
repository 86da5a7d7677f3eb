//! One-shot completion signal bridging dispatch callbacks to a waiting worker.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::time::Instant;

use super::lock;
use super::progress::{Progress, ProgressOutcome};
use crate::error::{DndError, Result};

/// Semaphore-backed completion signal carrying a result.
#[derive(Debug)]
pub struct CallbackEvent {
    semaphore: Semaphore,
    result: Mutex<Option<Result<()>>>,
}

impl Default for CallbackEvent {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackEvent {
    /// Create an unsignalled event
    pub fn new() -> Self {
        Self {
            semaphore: Semaphore::new(0),
            result: Mutex::new(None),
        }
    }

    /// Drop any pending signal and result
    pub fn reset(&self) {
        while let Ok(permit) = self.semaphore.try_acquire() {
            permit.forget();
        }
        *lock(&self.result) = None;
    }

    /// Store `result` (first one wins) and release one waiter
    pub fn notify(&self, result: Result<()>) {
        {
            let mut slot = lock(&self.result);
            if slot.is_none() {
                *slot = Some(result);
            }
        }
        self.semaphore.add_permits(1);
    }

    /// Check whether a signal is pending
    pub fn is_signalled(&self) -> bool {
        self.semaphore.available_permits() > 0
    }

    /// Wait up to `timeout`; `None` if nothing was signalled in time
    pub async fn wait(&self, timeout: Duration) -> Option<Result<()>> {
        match tokio::time::timeout(timeout, self.semaphore.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                Some(lock(&self.result).take().unwrap_or(Ok(())))
            },
            Ok(Err(_)) => Some(Err(DndError::InvalidState("event closed".to_string()))),
            Err(_) => None,
        }
    }
}

/// Wait for `event` in slices of `slice`, rechecking cancellation and the
/// progress object between slices, until `timeout` elapses.
pub async fn wait_for_event(
    event: &CallbackEvent,
    progress: &Progress,
    slice: Duration,
    timeout: Duration,
) -> Result<()> {
    let deadline = Instant::now() + timeout;

    loop {
        if progress.is_cancel_requested() {
            return Err(DndError::Cancelled);
        }

        match progress.outcome() {
            Some(ProgressOutcome::Success) => return Ok(()),
            Some(ProgressOutcome::Cancelled) => return Err(DndError::Cancelled),
            Some(ProgressOutcome::Failed { rc, message }) => {
                return Err(DndError::Guest { rc, message })
            },
            None => {},
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(DndError::Timeout(timeout.as_millis() as u64));
        }

        if let Some(result) = event.wait(slice.min(deadline - now)).await {
            return result;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_notify_before_wait() {
        let event = CallbackEvent::new();
        event.notify(Ok(()));
        assert!(event.is_signalled());
        assert!(matches!(event.wait(Duration::from_millis(10)).await, Some(Ok(()))));
    }

    #[tokio::test]
    async fn test_reset_clears_signal() {
        let event = CallbackEvent::new();
        event.notify(Err(DndError::Cancelled));
        event.reset();
        assert!(event.wait(Duration::from_millis(10)).await.is_none());
    }

    #[tokio::test]
    async fn test_first_result_wins() {
        let event = CallbackEvent::new();
        event.notify(Err(DndError::NotAvailable));
        event.notify(Ok(()));
        assert!(matches!(
            event.wait(Duration::from_millis(10)).await,
            Some(Err(DndError::NotAvailable))
        ));
    }

    #[tokio::test]
    async fn test_wait_for_event_times_out() {
        let event = CallbackEvent::new();
        let progress = Progress::new("test");
        let result = wait_for_event(
            &event,
            &progress,
            Duration::from_millis(5),
            Duration::from_millis(20),
        )
        .await;
        assert!(matches!(result, Err(DndError::Timeout(20))));
    }

    #[tokio::test]
    async fn test_wait_for_event_sees_cancel_within_slice() {
        let event = Arc::new(CallbackEvent::new());
        let progress = Progress::new("test");
        {
            let progress = progress.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                progress.cancel();
            });
        }
        let started = std::time::Instant::now();
        let result = wait_for_event(
            &event,
            &progress,
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
        .await;
        assert!(matches!(result, Err(DndError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
