use std::future::Future;
use anyhow::{anyhow, Result};
use tokio::time::{sleep, Duration};
use rand::Rng;

use crate::logging::{obj, v_int, v_str, warn, Domain};

/// Retry configuration
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 200,
            max_delay_ms: 10_000,
            jitter_factor: 0.3,
        }
    }
}

impl RetryConfig {
    /// Exponential backoff with ±jitter_factor jitter
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay_ms as f64);

        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        let final_delay = (clamped + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Retry a fallible async operation with exponential backoff.
///
/// An error for which `retryable` returns false is returned at once.
pub async fn retry_async<F, Fut, T, R>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
    retryable: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    R: Fn(&anyhow::Error) -> bool,
{
    let mut last_error: Option<anyhow::Error> = None;

    for attempt in 0..=config.max_retries {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !retryable(&e) {
                    return Err(e);
                }
                if attempt < config.max_retries {
                    let delay = config.delay_for_attempt(attempt);
                    warn(
                        Domain::Transport,
                        "retry",
                        obj(&[
                            ("op", v_str(operation_name)),
                            ("attempt", v_int(attempt as i64 + 1)),
                            ("max_attempts", v_int(config.max_retries as i64 + 1)),
                            ("error", v_str(&e.to_string())),
                            ("delay_ms", v_int(delay.as_millis() as i64)),
                        ]),
                    );
                    sleep(delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| anyhow!("retry_async exhausted without error")))
}

/// Statuses worth retrying
pub fn is_retryable_http_error(status: u16) -> bool {
    matches!(status,
        408 |   // Request Timeout
        429 |   // Too Many Requests
        500 |
        502 |
        503 |
        504
    )
}

/// Transport failures worth another attempt
pub fn is_retryable_network_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            jitter_factor: 0.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(1000)); // clamped
    }

    #[tokio::test]
    async fn test_retry_eventual_success() {
        let config = RetryConfig {
            max_retries: 3,
            base_delay_ms: 1,
            ..Default::default()
        };

        let counter = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<i32> = retry_async(&config, "test", || {
            let c = counter_clone.clone();
            async move {
                let attempt = c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if attempt < 2 {
                    Err(anyhow!("not yet"))
                } else {
                    Ok(42)
                }
            }
        }, |_| true).await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up() {
        let config = RetryConfig { max_retries: 1, base_delay_ms: 1, ..Default::default() };
        let result: Result<()> = retry_async(&config, "test", || async { Err(anyhow!("down")) }, |_| true).await;
        assert_eq!(result.unwrap_err().to_string(), "down");
    }

    #[tokio::test]
    async fn test_permanent_error_is_not_retried() {
        let config = RetryConfig { max_retries: 3, base_delay_ms: 1, ..Default::default() };
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<()> = retry_async(
            &config,
            "test",
            || {
                let c = calls_clone.clone();
                async move {
                    c.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                    Err(anyhow!("unauthorized"))
                }
            },
            |e| !e.to_string().contains("unauthorized"),
        )
        .await;

        assert_eq!(result.unwrap_err().to_string(), "unauthorized");
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable_http_error(429));
        assert!(!is_retryable_http_error(400));
    }
}
