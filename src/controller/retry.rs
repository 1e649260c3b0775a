//! Optimistic concurrency helpers

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

const CONFLICT_BASE_DELAY: Duration = Duration::from_millis(10);
const CONFLICT_MAX_DELAY: Duration = Duration::from_secs(1);

/// Exponential backoff: base * 2^attempt, capped at max
pub fn calculate_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let delay = base.saturating_mul(2_u32.saturating_pow(attempt.min(10)));
    delay.min(max)
}

/// Run a read-modify-write operation, retrying it while it fails with a
/// conflict. `op` must re-read the object on every call. Gives up after
/// `attempts` tries and returns the last error.
pub async fn retry_on_conflict<T, F, Fut>(attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt + 1 < attempts => {
                debug!("Conflict on attempt {}/{}: {}", attempt + 1, attempts, e);
                tokio::time::sleep(calculate_backoff(
                    attempt,
                    CONFLICT_BASE_DELAY,
                    CONFLICT_MAX_DELAY,
                ))
                .await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn conflict() -> Error {
        Error::Conflict {
            kind: "ObjectSet".to_string(),
            name: "a".to_string(),
            namespace: "ns".to_string(),
        }
    }

    #[test]
    fn test_backoff_calculation() {
        let base = Duration::from_millis(10);
        let max = Duration::from_secs(1);
        assert_eq!(calculate_backoff(0, base, max), Duration::from_millis(10));
        assert_eq!(calculate_backoff(1, base, max), Duration::from_millis(20));
        assert_eq!(calculate_backoff(3, base, max), Duration::from_millis(80));
        // Capped
        assert_eq!(calculate_backoff(7, base, max), Duration::from_secs(1));
        assert_eq!(calculate_backoff(u32::MAX, base, max), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result = retry_on_conflict(5, || async move {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(conflict())
            } else {
                Ok("done")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(3, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(conflict())
        })
        .await;

        assert!(result.unwrap_err().is_conflict());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_other_errors_are_not_retried() {
        let calls = &AtomicU32::new(0);
        let result: Result<()> = retry_on_conflict(5, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(Error::ValidationError("bad".to_string()))
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
