use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Retry policy for [`TransactionManager::with_retry`](super::TransactionManager::with_retry).
///
/// `retries` is the maximum number of attempts in total, so `retries: 3`
/// runs the work at most three times.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryOptions {
    pub retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Caller's own budget. Backoff never sleeps past it.
    pub deadline: Option<Duration>,
    /// Treat pool acquire timeouts as retryable.
    pub retry_acquire_timeout: bool,
    pub max_acquire_retries: u32,
    pub name: Option<String>,
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            backoff_ms: 10,
            max_backoff_ms: 250,
            deadline: None,
            retry_acquire_timeout: false,
            max_acquire_retries: 1,
            name: None,
        }
    }
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = backoff_ms;
        self
    }

    pub fn max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = max_backoff_ms;
        self
    }

    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn retry_acquire_timeout(mut self, max_retries: u32) -> Self {
        self.retry_acquire_timeout = true;
        self.max_acquire_retries = max_retries;
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        self.retries.max(1)
    }

    /// Exponential backoff before attempt `attempt + 1`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let base = self.backoff_ms.max(1);
        let max = self.max_backoff_ms.max(base);
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(base.saturating_mul(factor).min(max))
    }

    /// `base_delay` plus uniform jitter in `[0, base / 2]`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let half = (base.as_millis() as u64) / 2;
        let jitter = rand::thread_rng().gen_range(0..=half);
        base + Duration::from_millis(jitter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let options = RetryOptions::new().backoff_ms(10).max_backoff_ms(50);
        assert_eq!(options.base_delay(1), Duration::from_millis(10));
        assert_eq!(options.base_delay(2), Duration::from_millis(20));
        assert_eq!(options.base_delay(3), Duration::from_millis(40));
        assert_eq!(options.base_delay(4), Duration::from_millis(50));
        assert_eq!(options.base_delay(40), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_bounds() {
        let options = RetryOptions::new().backoff_ms(20).max_backoff_ms(20);
        for _ in 0..100 {
            let delay = options.delay(1);
            assert!(delay >= Duration::from_millis(20));
            assert!(delay <= Duration::from_millis(30));
        }
    }

    #[test]
    fn test_zero_retries_still_runs_once() {
        assert_eq!(RetryOptions::new().retries(0).max_attempts(), 1);
        assert_eq!(RetryOptions::new().retries(3).max_attempts(), 3);
    }
}
