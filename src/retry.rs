//! Retry engine: per-attempt timeout, exponential backoff with jitter,
//! and terminal-error opt-out (spec.md §4.1, §9 Open question 1)

use crate::config::AdapterConfig;
use crate::error::{AdapterError, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

/// Run `attempt` up to `config.max_attempts` times, applying
/// `config.per_attempt_timeout` to each call and sleeping
/// `min(max_delay, base_delay * 2^i) * jitter` between attempts, with
/// `jitter ~ Uniform(0.75, 1.25)` (spec.md §4.1).
///
/// `attempt` returns `Err(AdapterError::Terminal(_))` to opt an error
/// out of retry; the engine re-raises it without sleeping, regardless
/// of attempts remaining.
pub async fn retry_with_backoff<F, Fut, T>(
    op_name: &str,
    config: &AdapterConfig,
    mut attempt: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut last_error: Option<AdapterError> = None;

    for i in 0..config.max_attempts {
        // A zero deadline must always time out (spec.md §8), but
        // `tokio::time::timeout` polls the inner future once before
        // checking the deadline, so a synchronously-ready op would
        // otherwise slip through as `Ok`. Special-case it instead of
        // racing the clock.
        let outcome = if config.per_attempt_timeout.is_zero() {
            Err(AdapterError::Timeout {
                op: op_name.to_string(),
                timeout: config.per_attempt_timeout,
            })
        } else {
            match tokio::time::timeout(config.per_attempt_timeout, attempt()).await {
                Ok(result) => result,
                Err(_) => Err(AdapterError::Timeout {
                    op: op_name.to_string(),
                    timeout: config.per_attempt_timeout,
                }),
            }
        };

        match outcome {
            Ok(value) => return Ok(value),
            Err(AdapterError::Terminal(inner)) => return Err(*inner),
            Err(err) => {
                let is_last = i + 1 >= config.max_attempts;
                if is_last {
                    warn!(op_name, attempt = i + 1, "operation failed after all retries");
                    last_error = Some(err);
                    break;
                }
                let delay = backoff_delay(config.base_delay, config.max_delay, i);
                debug!(op_name, attempt = i + 1, ?delay, "retrying after failure");
                last_error = Some(err);
                tokio::time::sleep(delay).await;
            }
        }
    }

    Err(last_error.unwrap_or_else(|| AdapterError::OperationError {
        op: op_name.to_string(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::Other,
            "retry loop exited without a recorded error",
        )),
    }))
}

fn backoff_delay(base_delay: Duration, max_delay: Duration, attempt: u32) -> Duration {
    let exp = base_delay.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX));
    let capped = exp.min(max_delay);
    let jitter: f64 = rand::rng().random_range(0.75..1.25);
    Duration::from_secs_f64(capped.as_secs_f64() * jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_attempts: u32) -> AdapterConfig {
        let mut config = AdapterConfig::default();
        config.max_attempts = max_attempts;
        config.per_attempt_timeout = Duration::from_millis(200);
        config.base_delay = Duration::from_millis(1);
        config.max_delay = Duration::from_millis(5);
        config
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_sleeping() {
        let config = fast_config(3);
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("op", &config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, AdapterError>(42)
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_then_succeeds() {
        let config = fast_config(3);
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff("op", &config, || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(AdapterError::OperationError {
                    op: "op".to_string(),
                    source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "x")),
                })
            } else {
                Ok(99)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 99);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_attempts_and_returns_last_error() {
        let config = fast_config(2);
        let calls = AtomicU32::new(0);
        let result: Result<i32> = retry_with_backoff("op", &config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::OperationError {
                op: "op".to_string(),
                source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "x")),
            })
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn max_attempts_one_never_sleeps_between_attempts() {
        let config = fast_config(1);
        let calls = AtomicU32::new(0);
        let start = std::time::Instant::now();
        let _ = retry_with_backoff::<_, _, i32>("op", &config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::OperationError {
                op: "op".to_string(),
                source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "x")),
            })
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(start.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn terminal_error_short_circuits_without_retrying() {
        let config = fast_config(5);
        let calls = AtomicU32::new(0);
        let result: Result<i32> = retry_with_backoff("op", &config, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(AdapterError::OperationError {
                op: "op".to_string(),
                source: Box::new(std::io::Error::new(std::io::ErrorKind::Other, "nonretryable")),
            }
            .terminal())
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn per_attempt_timeout_zero_always_times_out() {
        let mut config = fast_config(1);
        config.per_attempt_timeout = Duration::from_secs(0);
        let result: Result<i32> = retry_with_backoff("op", &config, || async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(1)
        })
        .await;
        assert!(matches!(result, Err(AdapterError::Timeout { .. })));
    }
}
