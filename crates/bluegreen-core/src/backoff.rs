//! Bounded exponential backoff for retrying transient cloud API failures.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::duration;

/// Retry schedule: `initial`, doubling per attempt, capped at `max`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    #[serde(with = "duration")]
    pub initial: Duration,
    #[serde(with = "duration")]
    pub max: Duration,
    /// Total attempts including the first one.
    pub attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
            attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Delay to wait after the given failed attempt (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let mut delay = self.initial;
        for _ in 1..attempt {
            delay = (delay * 2).min(self.max);
        }
        delay.min(self.max)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempt budget is exhausted. The last error is returned.
pub async fn retry<T, E, F, Fut>(
    backoff: &BackoffConfig,
    operation: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let attempts = backoff.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts && is_retryable(&e) => {
                let delay = backoff.delay_after(attempt);
                warn!(
                    operation,
                    attempt,
                    attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast() -> BackoffConfig {
        BackoffConfig {
            initial: Duration::from_millis(100),
            max: Duration::from_millis(400),
            attempts: 4,
        }
    }

    #[test]
    fn delay_doubles_and_caps() {
        let b = fast();
        assert_eq!(b.delay_after(1), Duration::from_millis(100));
        assert_eq!(b.delay_after(2), Duration::from_millis(200));
        assert_eq!(b.delay_after(3), Duration::from_millis(400));
        assert_eq!(b.delay_after(9), Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = &AtomicU32::new(0);
        let result: Result<u32, String> = retry(&fast(), "test", |_| true, || async move {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 { Err(format!("flaky {n}")) } else { Ok(n) }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_budget() {
        let calls = &AtomicU32::new(0);
        let result: Result<(), String> = retry(&fast(), "test", |_| true, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("down".to_string())
        })
        .await;
        assert_eq!(result, Err("down".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_fails_immediately() {
        let calls = &AtomicU32::new(0);
        let is_retryable = |e: &String| e != "quota";
        let result: Result<(), String> = retry(&fast(), "test", is_retryable, || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Err("quota".to_string())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
