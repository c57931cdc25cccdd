//! Bounded retries with exponential backoff, jitter, and per-attempt deadlines.
//!
//! Every connector routes its I/O through [`RetryPolicy::execute`]:
//!
//! - each attempt races a deadline ([`with_timeout`]); expiry is a retryable
//!   [`DataSourceError::Timeout`] and the late result is dropped
//! - errors whose [`is_retryable`](DataSourceError::is_retryable) flag is false
//!   are returned immediately
//! - after attempt *n* the policy sleeps
//!   `min(base_delay * multiplier^(n-1), max_delay)` plus up to 10% jitter
//! - once `max_attempts` is spent the last error is wrapped in
//!   [`DataSourceError::MaxRetriesExceeded`]

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::clamp_field;
use crate::error::DataSourceError;

/// Fraction of the backoff delay added as random jitter, at most.
const JITTER_RATIO: f64 = 0.1;

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct RetryOptions {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}
fn default_max_delay_ms() -> u64 {
    30_000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl RetryOptions {
    /// Pull each field into its supported range, warning on every change.
    pub fn clamp(&mut self) {
        clamp_field("retry.max_attempts", &mut self.max_attempts, 1, 10);
        clamp_field("retry.max_delay_ms", &mut self.max_delay_ms, 1, 300_000);
        clamp_field("retry.base_delay_ms", &mut self.base_delay_ms, 0, self.max_delay_ms);
        clamp_field("retry.backoff_multiplier", &mut self.backoff_multiplier, 1.0, 10.0);
    }

    /// Backoff before the attempt that follows attempt `attempt` (1-based),
    /// without jitter.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1) as i32;
        let raw = self.base_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = raw.min(self.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    fn jittered_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_delay(attempt);
        let jitter = rand::thread_rng().gen_range(0.0..=JITTER_RATIO);
        base + base.mul_f64(jitter)
    }
}

/// Race `fut` against `timeout`.
///
/// On expiry the future is dropped and a retryable
/// [`DataSourceError::Timeout`] is returned.
pub async fn with_timeout<T, Fut>(
    source_id: &str,
    timeout: Duration,
    fut: Fut,
) -> Result<T, DataSourceError>
where
    Fut: Future<Output = Result<T, DataSourceError>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(DataSourceError::Timeout {
            source_id: source_id.to_string(),
            timeout,
        }),
    }
}

/// Retry driver shared by all connectors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    options: RetryOptions,
    timeout: Duration,
}

impl RetryPolicy {
    pub fn new(options: RetryOptions, timeout: Duration) -> Self {
        Self { options, timeout }
    }

    pub fn options(&self) -> &RetryOptions {
        &self.options
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `op` until it succeeds, fails non-retryably, or the attempt budget
    /// is spent. `op` is invoked once per attempt.
    pub async fn execute<T, F, Fut>(&self, source_id: &str, op: F) -> Result<T, DataSourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DataSourceError>>,
    {
        self.execute_observed(source_id, op, |_, _| {}).await
    }

    /// Like [`execute`](Self::execute), reporting each attempt's outcome and
    /// latency (timeouts included) to `observe`.
    pub async fn execute_observed<T, F, Fut, O>(
        &self,
        source_id: &str,
        mut op: F,
        mut observe: O,
    ) -> Result<T, DataSourceError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, DataSourceError>>,
        O: FnMut(bool, Duration),
    {
        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let started = std::time::Instant::now();
            let outcome = with_timeout(source_id, self.timeout, op()).await;
            observe(outcome.is_ok(), started.elapsed());
            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            if !err.is_retryable() {
                tracing::debug!(source_id, attempt, code = err.code(), "non-retryable failure");
                return Err(err);
            }

            if attempt >= max_attempts {
                return Err(DataSourceError::MaxRetriesExceeded {
                    source_id: source_id.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let mut delay = self.options.jittered_delay(attempt);
            if let DataSourceError::RateLimit {
                retry_after: Some(hint),
                ..
            } = &err
            {
                delay = delay
                    .max(*hint)
                    .min(Duration::from_millis(self.options.max_delay_ms));
            }

            tracing::warn!(
                source_id,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after failure"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    fn fast_options(max_attempts: u32) -> RetryOptions {
        RetryOptions {
            max_attempts,
            base_delay_ms: 20,
            max_delay_ms: 1000,
            backoff_multiplier: 2.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let opts = RetryOptions {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 500,
            backoff_multiplier: 2.0,
        };
        assert_eq!(opts.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(opts.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(opts.backoff_delay(3), Duration::from_millis(400));
        assert_eq!(opts.backoff_delay(4), Duration::from_millis(500));
        assert_eq!(opts.backoff_delay(9), Duration::from_millis(500));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let opts = fast_options(3);
        for _ in 0..50 {
            let d = opts.jittered_delay(2);
            assert!(d >= Duration::from_millis(40));
            assert!(d <= Duration::from_millis(44));
        }
    }

    #[tokio::test]
    async fn test_retryable_failure_uses_every_attempt() {
        let policy = RetryPolicy::new(fast_options(3), Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));
        let started = Instant::now();

        let counter = calls.clone();
        let result: Result<(), _> = policy
            .execute("flaky", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DataSourceError::connection("flaky", "connection reset"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // 20ms + 40ms of backoff between the three attempts
        assert!(started.elapsed() >= Duration::from_millis(60));
        match result.unwrap_err() {
            DataSourceError::MaxRetriesExceeded { attempts, last, .. } => {
                assert_eq!(attempts, 3);
                assert!(matches!(*last, DataSourceError::Connection { .. }));
            }
            other => panic!("expected MaxRetriesExceeded, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_failure_aborts_after_one_attempt() {
        let policy = RetryPolicy::new(fast_options(5), Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let result: Result<(), _> = policy
            .execute("api", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(DataSourceError::authentication("api", "HTTP 401"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.unwrap_err(),
            DataSourceError::Authentication { .. }
        ));
    }

    #[tokio::test]
    async fn test_recovers_after_transient_failure() {
        let policy = RetryPolicy::new(fast_options(3), Duration::from_secs(5));
        let calls = Arc::new(AtomicU32::new(0));

        let counter = calls.clone();
        let value = policy
            .execute("db", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(DataSourceError::connection("db", "ECONNRESET"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_each_attempt_is_bounded_by_timeout() {
        let policy = RetryPolicy::new(fast_options(2), Duration::from_millis(30));
        let result: Result<(), _> = policy
            .execute("slow", || async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(())
            })
            .await;

        match result.unwrap_err() {
            DataSourceError::MaxRetriesExceeded { attempts, last, .. } => {
                assert_eq!(attempts, 2);
                assert!(matches!(*last, DataSourceError::Timeout { .. }));
            }
            other => panic!("expected MaxRetriesExceeded, got {:?}", other),
        }
    }
}
