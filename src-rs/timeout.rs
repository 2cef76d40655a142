use std::{future::Future, time::Duration};

use thiserror::Error;

#[derive(Debug, Error)]
#[error("operation timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Bounds `future` by `duration`. On expiry the future is dropped, which
/// cancels any in-flight request it owns.
pub async fn with_timeout<F>(duration: Duration, future: F) -> Result<F::Output, TimedOut>
where
    F: Future,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimedOut(duration))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn completes_before_deadline() {
        let result = with_timeout(Duration::from_millis(200), async { 7 }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn expires_slow_operations() {
        let result = with_timeout(Duration::from_millis(20), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            7
        })
        .await;

        assert!(result.is_err());
    }
}
