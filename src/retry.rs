//! Bounded retry with exponential backoff and full jitter.
//!
//! One retry policy for every outbound call the core makes through the
//! exchange client (REST book refresh, balance polls) so transient network
//! and 5xx errors do not surface as gaps or missed reconciliations.

use anyhow::Result;
use rand::Rng;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first try
    pub max_attempts: u32,
    /// Base delay in milliseconds for the exponential schedule
    pub base_delay_ms: u64,
    /// Cap on any single backoff delay
    pub max_delay_ms: u64,
    /// Hard ceiling on total elapsed time across attempts
    pub max_elapsed_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay_ms: 100,
            max_delay_ms: 1500,
            max_elapsed_ms: 4000,
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let parse = |name: &str, default: u64| {
            std::env::var(name)
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(default)
        };
        Self {
            max_attempts: (parse("RETRY_MAX_ATTEMPTS", 4) as u32).min(10),
            base_delay_ms: parse("RETRY_BASE_DELAY_MS", 100),
            max_delay_ms: parse("RETRY_MAX_DELAY_MS", 1500),
            max_elapsed_ms: parse("RETRY_MAX_ELAPSED_MS", 4000),
        }
    }

    /// Backoff for an attempt: min(cap, base * 2^(attempt-1)) with full
    /// jitter in [0, backoff) to spread retry storms.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let capped = self.capped_backoff(attempt);
        if capped == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..capped)
        }
    }

    fn capped_backoff(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let multiplier = if exponent >= 32 {
            u64::MAX
        } else {
            1u64 << exponent
        };
        self.base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms)
    }

    /// Deterministic-jitter variant for tests.
    #[cfg(test)]
    pub fn backoff_ms_with_jitter(&self, attempt: u32, jitter_fn: impl Fn(u64) -> u64) -> u64 {
        jitter_fn(self.capped_backoff(attempt))
    }
}

/// Error classification extracted from an `anyhow::Error` chain.
#[derive(Debug)]
pub struct RetryableError {
    pub status_code: Option<u16>,
    pub retry_after_secs: Option<u64>,
    pub message: String,
}

impl RetryableError {
    pub fn from_status(status: u16, message: String) -> Self {
        Self {
            status_code: Some(status),
            retry_after_secs: None,
            message,
        }
    }

    pub fn from_network(message: String) -> Self {
        Self {
            status_code: None,
            retry_after_secs: None,
            message,
        }
    }

    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let message = err.to_string();

        if let Some(reqwest_err) = err.downcast_ref::<reqwest::Error>() {
            if let Some(status) = reqwest_err.status() {
                return Self::from_status(status.as_u16(), message);
            }
            if reqwest_err.is_timeout() || reqwest_err.is_connect() {
                return Self::from_network(message);
            }
        }

        // Unknown errors are treated as network (retryable)
        Self::from_network(message)
    }
}

/// Retryable: network errors, 408, 425, 429, and 5xx. Other 4xx are not.
pub fn is_retryable(err: &RetryableError) -> bool {
    match err.status_code {
        Some(status) => matches!(status, 408 | 425 | 429 | 500..=599),
        None => true,
    }
}

/// Retry an async operation under the given policy.
pub async fn retry_async<T, Fut, F>(
    policy: &RetryPolicy,
    op_name: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start = std::time::Instant::now();
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(
                        "retry op={} succeeded after {} attempts (elapsed={}ms)",
                        op_name,
                        attempt,
                        start.elapsed().as_millis()
                    );
                }
                return Ok(value);
            }
            Err(err) => {
                let retry_err = RetryableError::from_anyhow(&err);

                if !is_retryable(&retry_err) {
                    debug!(
                        "retry op={} non-retryable error: {}",
                        op_name, retry_err.message
                    );
                    return Err(err);
                }

                if attempt >= policy.max_attempts {
                    warn!(
                        "retry op={} failed after {} attempts (elapsed={}ms): {}",
                        op_name,
                        attempt,
                        start.elapsed().as_millis(),
                        retry_err.message
                    );
                    return Err(err);
                }

                let elapsed_ms = start.elapsed().as_millis() as u64;
                if elapsed_ms >= policy.max_elapsed_ms {
                    warn!(
                        "retry op={} timeout after {}ms (max={}ms): {}",
                        op_name, elapsed_ms, policy.max_elapsed_ms, retry_err.message
                    );
                    return Err(err);
                }

                // Honor Retry-After when present, capped to the policy max
                let mut backoff_ms = match retry_err.retry_after_secs {
                    Some(retry_after) => (retry_after * 1000).min(policy.max_delay_ms),
                    None => policy.backoff_ms(attempt),
                };
                backoff_ms = backoff_ms.min(policy.max_elapsed_ms.saturating_sub(elapsed_ms));

                debug!(
                    "retry op={} attempt={} backoff_ms={} status={:?}",
                    op_name, attempt, backoff_ms, retry_err.status_code
                );

                if backoff_ms > 0 {
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                }

                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_defaults() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay_ms, 100);
        assert_eq!(policy.max_delay_ms, 1500);
        assert_eq!(policy.max_elapsed_ms, 4000);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy::default();
        let jitter = |cap: u64| cap / 2;

        assert_eq!(policy.backoff_ms_with_jitter(1, jitter), 50);
        assert_eq!(policy.backoff_ms_with_jitter(2, jitter), 100);
        assert_eq!(policy.backoff_ms_with_jitter(3, jitter), 200);
        assert_eq!(policy.backoff_ms_with_jitter(4, jitter), 400);
        // 1600 capped to 1500, then halved
        assert_eq!(policy.backoff_ms_with_jitter(5, jitter), 750);
    }

    #[test]
    fn test_backoff_respects_max_delay() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 100,
            max_delay_ms: 1000,
            max_elapsed_ms: 10000,
        };
        let jitter = |cap: u64| cap;

        assert_eq!(policy.backoff_ms_with_jitter(10, jitter), 1000);
        assert_eq!(policy.backoff_ms_with_jitter(40, jitter), 1000);
    }

    #[test]
    fn test_is_retryable_classification() {
        assert!(is_retryable(&RetryableError::from_status(
            500,
            "server".into()
        )));
        assert!(is_retryable(&RetryableError::from_status(
            429,
            "rate".into()
        )));
        assert!(is_retryable(&RetryableError::from_network(
            "connection reset".into()
        )));

        assert!(!is_retryable(&RetryableError::from_status(
            400,
            "bad".into()
        )));
        assert!(!is_retryable(&RetryableError::from_status(
            404,
            "missing".into()
        )));
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_second_attempt() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay_ms: 10,
            max_delay_ms: 50,
            max_elapsed_ms: 1000,
        };

        let mut attempt_count = 0;
        let result = retry_async(&policy, "test_op", || {
            attempt_count += 1;
            async move {
                if attempt_count < 2 {
                    anyhow::bail!("simulated 503");
                }
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 2);
    }

    #[tokio::test]
    async fn test_retry_fails_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay_ms: 10,
            max_delay_ms: 50,
            max_elapsed_ms: 1000,
        };

        let mut attempt_count = 0;
        let result: Result<i32> = retry_async(&policy, "test_op", || {
            attempt_count += 1;
            async move { anyhow::bail!("persistent failure") }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 3);
    }
}
