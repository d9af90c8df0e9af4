//! Retry policy with exponential backoff
//!
//! The dispatcher turns a [`RetryConfig`] into the redelivery delay for a
//! failed delivery; [`retry_with_backoff`] retries in place, as dead-letter
//! writes do.

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Backoff after the first failure (doubles on each retry)
    pub initial_backoff: Duration,
    /// Maximum backoff duration to cap exponential growth
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Delay before the attempt that follows failed attempt `attempt` (1-based)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.initial_backoff
            .checked_mul(1u32 << exponent)
            .map_or(self.max_backoff, |d| d.min(self.max_backoff))
    }

    /// Whether failed attempt `attempt` was the last one allowed
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Run `operation` until it succeeds or `config.max_attempts` is reached
///
/// Sleeps [`RetryConfig::backoff_for_attempt`] between attempts and returns
/// the last error once the attempts are used up. `context` names the
/// operation in logs.
///
/// ```rust
/// use event_bus::consumer_retry::{retry_with_backoff, RetryConfig};
/// use event_bus::{DeadLetter, DeadLetterSink, InMemoryDeadLetterQueue};
///
/// # async fn park(letter: DeadLetter) -> event_bus::BusResult<()> {
/// let dlq = InMemoryDeadLetterQueue::new();
/// let policy = RetryConfig::default();
/// retry_with_backoff(|| dlq.dead_letter(&letter), &policy, "dead_letter_write").await
/// # }
/// ```
pub async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    config: &RetryConfig,
    context: &str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display + Send,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    debug!(context = %context, attempt, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) => {
                if config.is_exhausted(attempt) {
                    warn!(
                        context = %context,
                        attempts = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                }

                let backoff = config.backoff_for_attempt(attempt);
                warn!(
                    context = %context,
                    attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying with backoff"
                );

                sleep(backoff).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = RetryConfig {
            max_attempts: 10,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };

        assert_eq!(config.backoff_for_attempt(1), Duration::from_millis(10));
        assert_eq!(config.backoff_for_attempt(2), Duration::from_millis(20));
        assert_eq!(config.backoff_for_attempt(3), Duration::from_millis(40));
        assert_eq!(config.backoff_for_attempt(4), Duration::from_millis(50));
        assert_eq!(config.backoff_for_attempt(200), Duration::from_millis(50));
    }

    #[test]
    fn test_exhaustion_boundary() {
        let config = RetryConfig::default();
        assert!(!config.is_exhausted(4));
        assert!(config.is_exhausted(5));
    }

    #[tokio::test]
    async fn test_retry_succeeds_first_attempt() {
        let config = RetryConfig::default();
        let result =
            retry_with_backoff(|| async { Ok::<_, String>(42) }, &config, "test_operation").await;

        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        };
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();

        let result = retry_with_backoff(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    let mut count = attempts.lock().unwrap();
                    *count += 1;
                    if *count < 3 {
                        Err(format!("Attempt {}", *count))
                    } else {
                        Ok(42)
                    }
                }
            },
            &config,
            "test_operation",
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(*attempts.lock().unwrap(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_fails_after_max_attempts() {
        let config = RetryConfig {
            max_attempts: 4,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(50),
        };
        let attempts = Arc::new(Mutex::new(0));
        let attempts_clone = attempts.clone();
        let start = tokio::time::Instant::now();

        let result = retry_with_backoff(
            || {
                let attempts = attempts_clone.clone();
                async move {
                    *attempts.lock().unwrap() += 1;
                    Err::<i32, _>("persistent error")
                }
            },
            &config,
            "test_operation",
        )
        .await;

        assert_eq!(result, Err("persistent error"));
        assert_eq!(*attempts.lock().unwrap(), 4);
        // 10ms + 20ms + 40ms between the four attempts
        assert!(start.elapsed() >= Duration::from_millis(70));
    }
}
