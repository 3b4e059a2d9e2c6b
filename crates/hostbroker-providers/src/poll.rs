//! Interval polling with a deadline and cancellation

use std::future::Future;
use std::time::Duration;

use hostbroker_core::BrokerError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Polling parameters
#[derive(Debug, Clone, Copy)]
pub struct PollOptions {
    /// Delay between checks
    pub interval: Duration,
    /// Give up after this long; `None` waits indefinitely
    pub deadline: Option<Duration>,
}

impl PollOptions {
    /// Options with an interval and no deadline
    #[must_use]
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
        }
    }

    /// Set the deadline
    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }
}

/// Call `check` until it yields a value
///
/// `check` returns `Ok(None)` while the operation is still running.
///
/// # Errors
/// Returns the first error from `check`, or `BrokerError::Provider` when the
/// deadline passes or `cancel` fires
pub async fn poll_until<T, F, Fut>(
    provider: &str,
    what: &str,
    options: PollOptions,
    cancel: &CancellationToken,
    mut check: F,
) -> Result<T, BrokerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, BrokerError>>,
{
    let started = Instant::now();
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        if let Some(value) = check().await? {
            return Ok(value);
        }
        debug!(provider, what, attempt, "still waiting");

        if let Some(deadline) = options.deadline
            && started.elapsed() >= deadline
        {
            return Err(BrokerError::provider(
                provider,
                format!("{what} did not complete within {deadline:?}"),
            ));
        }

        tokio::select! {
            () = cancel.cancelled() => {
                return Err(BrokerError::provider(provider, format!("{what} was cancelled")));
            }
            () = tokio::time::sleep(options.interval) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test]
    async fn test_returns_when_ready() {
        let calls = AtomicU32::new(0);
        let value = poll_until(
            "Test",
            "job 1",
            PollOptions::every(Duration::ZERO),
            &CancellationToken::new(),
            || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                Ok((n == 2).then_some(n))
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test]
    async fn test_deadline() {
        let err = poll_until::<(), _, _>(
            "Test",
            "job 1",
            PollOptions::every(Duration::from_millis(5))
                .with_deadline(Some(Duration::from_millis(20))),
            &CancellationToken::new(),
            || async { Ok(None) },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("job 1 did not complete within"));
    }

    #[tokio::test]
    async fn test_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = poll_until::<(), _, _>(
            "Test",
            "job 1",
            PollOptions::every(Duration::from_secs(60)),
            &cancel,
            || async { Ok(None) },
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("cancelled"));
    }
}
