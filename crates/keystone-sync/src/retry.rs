//! # Retry Policy
//!
//! One retry schedule shared by the transport, the per-table fetch in the
//! sync engine and queue replay.
//!
//! Only errors for which [`SyncError::is_retryable`] holds are retried. Auth
//! failures, 4xx rejections and local errors return immediately.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use tracing::{debug, warn};

use crate::config::RetrySettings;
use crate::error::SyncResult;

/// Bounded exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from_settings(&RetrySettings::default())
    }
}

impl RetryPolicy {
    pub fn from_settings(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts.max(1),
            initial_backoff: Duration::from_millis(settings.initial_backoff_ms),
            max_backoff: Duration::from_secs(settings.max_backoff_secs),
            multiplier: settings.multiplier,
        }
    }

    /// A policy that makes exactly one attempt.
    pub fn no_retry() -> Self {
        RetryPolicy {
            max_attempts: 1,
            ..RetryPolicy::default()
        }
    }

    fn schedule(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(self.initial_backoff)
            .with_max_interval(self.max_backoff.max(self.initial_backoff))
            .with_multiplier(self.multiplier.max(1.0))
            .with_randomization_factor(0.3)
            .with_max_elapsed_time(None)
            .build()
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// `max_attempts` attempts have been made.
    ///
    /// ## Returns
    /// The first success, or the last error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let mut schedule = self.schedule();
        let mut attempt = 1;

        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < self.max_attempts => {
                    let delay = schedule.next_backoff().unwrap_or(self.max_backoff);
                    warn!(
                        what = %what,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    debug!(what = %what, attempt, error = %e, "Giving up");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
            multiplier: 2.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let result = fast(5)
            .run("flaky", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(SyncError::NetworkError("reset".into()))
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_max_attempts() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = fast(3)
            .run("down", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::ServerError { status: 503, message: "down".into() })
            })
            .await;

        assert!(matches!(result, Err(SyncError::ServerError { status: 503, .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_fails_fast() {
        let calls = AtomicU32::new(0);
        let result: SyncResult<()> = fast(5)
            .run("rejected", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SyncError::AuthError("expired".into()))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_from_settings_clamps_attempts() {
        let settings = RetrySettings {
            max_attempts: 0,
            ..RetrySettings::default()
        };
        assert_eq!(RetryPolicy::from_settings(&settings).max_attempts, 1);
        assert_eq!(RetryPolicy::no_retry().max_attempts, 1);
    }
}
