//! Retry policy for transient failures.
//!
//! Only errors classified `TransientIo` (network timeouts, provider 5xx,
//! rate limits, MCP transport hiccups) are retried. Backoff is exponential
//! with jitter, starting at 250 ms and capped at 8 s. Fatal errors and
//! cancellation propagate immediately; schema/length violations are never
//! blind-retried (the node issues a corrective re-prompt instead).

use crate::error::{CoreError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Configuration for retrying transient failures.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: usize,
    /// Initial interval between retries in seconds.
    pub initial_interval: f64,
    /// Multiplier for the interval after each retry.
    pub backoff_factor: f64,
    /// Maximum interval between retries in seconds.
    pub max_interval: f64,
    /// Whether to add random jitter to intervals.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_interval: 0.25,
            backoff_factor: 2.0,
            max_interval: 8.0,
            jitter: true,
        }
    }

    pub fn with_initial_interval(mut self, seconds: f64) -> Self {
        self.initial_interval = seconds;
        self
    }

    pub fn with_backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor;
        self
    }

    pub fn with_max_interval(mut self, seconds: f64) -> Self {
        self.max_interval = seconds;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry following `attempt` (0-indexed).
    ///
    /// Exponential: `initial * factor^attempt`, capped at `max_interval`,
    /// multiplied by a random factor in 0.5..=1.5 when jitter is on.
    pub fn calculate_delay(&self, attempt: usize) -> Duration {
        let base = self.initial_interval * self.backoff_factor.powi(attempt as i32);
        let capped = base.min(self.max_interval);
        let final_delay = if self.jitter {
            let mut rng = rand::thread_rng();
            capped * rng.gen_range(0.5..=1.5)
        } else {
            capped
        };
        Duration::from_secs_f64(final_delay)
    }

    pub fn should_retry(&self, attempt: usize) -> bool {
        attempt < self.max_attempts
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Run `op` under the policy, retrying transient errors only.
///
/// The backoff sleep races the cancellation signal; cancellation wins and
/// surfaces as [`CoreError::Cancelled`].
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> Result<T>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(CoreError::Cancelled);
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && policy.should_retry(attempt + 1) => {
                let delay = policy.calculate_delay(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying transient failure");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(CoreError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_defaults_match_backoff_contract() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.initial_interval, 0.25);
        assert_eq!(policy.max_interval, 8.0);
    }

    #[test]
    fn test_exponential_backoff_capped() {
        let policy = RetryPolicy::new(10).with_jitter(false);
        assert_eq!(policy.calculate_delay(0).as_secs_f64(), 0.25);
        assert_eq!(policy.calculate_delay(1).as_secs_f64(), 0.5);
        assert_eq!(policy.calculate_delay(2).as_secs_f64(), 1.0);
        // 0.25 * 2^8 = 64, capped at 8.
        assert_eq!(policy.calculate_delay(8).as_secs_f64(), 8.0);
    }

    #[test]
    fn test_jitter_stays_in_band() {
        let policy = RetryPolicy::new(5);
        for _ in 0..20 {
            let d = policy.calculate_delay(2).as_secs_f64();
            assert!((0.5..=1.5).contains(&(d / 1.0)), "delay {d} out of band");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_then_success() {
        let policy = RetryPolicy::new(3).with_jitter(false);
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        let result = retry_transient(&policy, &cancel, |_| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(CoreError::timeout("llm call", 100))
                } else {
                    Ok(42)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_not_retried() {
        let policy = RetryPolicy::new(5).with_jitter(false);
        let cancel = CancellationToken::new();
        let calls = AtomicUsize::new(0);

        let result: Result<()> = retry_transient(&policy, &cancel, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(CoreError::provider("401 unauthorized", false)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_backoff() {
        let policy = RetryPolicy::new(10).with_jitter(false).with_initial_interval(5.0);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result: Result<()> = retry_transient(&policy, &cancel, |_| async {
            Err(CoreError::timeout("llm call", 100))
        })
        .await;

        assert!(matches!(result, Err(CoreError::Cancelled)));
    }
}
