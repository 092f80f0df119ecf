//! Retry logic with exponential backoff for transient provider errors.

use crate::error::ProviderError;
use std::thread;
use std::time::Duration;

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,
    /// Base delay between retries
    pub base_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_factor: f64,
    /// Maximum delay between retries
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Calculate the delay for a given attempt number (0-indexed).
    ///
    /// A factor below 1.0 or not finite is treated as 1.0, so the delay
    /// never shrinks and always stays within `max_delay`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = if self.backoff_factor.is_finite() && self.backoff_factor >= 1.0 {
            self.backoff_factor
        } else {
            1.0
        };
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let delay = self.base_delay.as_secs_f64() * factor.powi(exponent);
        if delay.is_finite() && delay < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(delay)
        } else {
            self.max_delay
        }
    }

    /// Create a config that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Execute a provider call, retrying retryable errors with exponential backoff.
///
/// Permanent errors return immediately. When all attempts fail, the last
/// error is returned.
pub fn with_retry<T, F>(config: &RetryConfig, label: &str, mut operation: F) -> Result<T, ProviderError>
where
    F: FnMut() -> Result<T, ProviderError>,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt + 1 >= attempts => return Err(e),
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                log::warn!(
                    "{label}: attempt {}/{} failed: {e}. Retrying in {}ms",
                    attempt + 1,
                    attempts,
                    delay.as_millis()
                );
                thread::sleep(delay);
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn fast(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(1),
            backoff_factor: 1.0,
            max_delay: Duration::from_millis(5),
        }
    }

    #[test]
    fn test_delay_grows_exponentially() {
        let config = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            backoff_factor: 2.0,
            max_delay: Duration::from_secs(5),
        };
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(5));
    }

    #[test]
    fn test_bad_backoff_factor_does_not_panic() {
        for factor in [-3.0, 0.25, f64::NAN, f64::INFINITY] {
            let config = RetryConfig {
                max_attempts: 5,
                base_delay: Duration::from_millis(100),
                backoff_factor: factor,
                max_delay: Duration::from_secs(1),
            };
            assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100), "{factor}");
            assert_eq!(config.delay_for_attempt(3), Duration::from_millis(100), "{factor}");
        }
    }

    #[test]
    fn test_huge_attempt_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(u32::MAX), config.max_delay);
    }

    #[test]
    fn test_permanent_error_is_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), _> = with_retry(&fast(5), "create A", || {
            calls.set(calls.get() + 1);
            Err(ProviderError::Rejected("invalid".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_transient_error_eventually_succeeds() {
        let calls = Cell::new(0);
        let result = with_retry(&fast(3), "create A", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(ProviderError::Transient("throttled".into()))
            } else {
                Ok(7)
            }
        });
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_attempts_exhausted_returns_last_error() {
        let calls = Cell::new(0);
        let result: Result<(), _> = with_retry(&fast(2), "create A", || {
            calls.set(calls.get() + 1);
            Err(ProviderError::Transient(format!("attempt {}", calls.get())))
        });
        assert_eq!(result.unwrap_err(), ProviderError::Transient("attempt 2".into()));
        assert_eq!(calls.get(), 2);
    }

    #[test]
    fn test_no_retry_runs_once() {
        let calls = Cell::new(0);
        let _: Result<(), _> = with_retry(&RetryConfig::no_retry(), "delete A", || {
            calls.set(calls.get() + 1);
            Err(ProviderError::Transient("busy".into()))
        });
        assert_eq!(calls.get(), 1);
    }
}
