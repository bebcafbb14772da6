//! Retry with exponential backoff and jitter
//!
//! Used by the schema registry client; the intake engine itself never
//! retries (redelivery after nak is the retry mechanism).

use crate::error::{Result, SluiceError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Retry attempts after the initial one.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per retry.
    pub backoff_multiplier: f64,
    /// Jitter factor in [0, 1]; fraction of the delay randomized.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry `attempt` (1-indexed), jittered.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let capped = attempt.min(30);
        let base = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(capped as i32 - 1);
        let capped_delay = base.min(self.max_delay.as_millis() as f64);

        let jitter = if self.jitter_factor > 0.0 {
            let range = capped_delay * self.jitter_factor;
            rand::thread_rng().gen_range(-range..=range)
        } else {
            0.0
        };
        Duration::from_millis((capped_delay + jitter).max(0.0) as u64)
    }
}

/// Run `operation`, retrying on errors classified retriable by
/// [`SluiceError::is_retriable`]. Terminal errors return immediately.
pub async fn retry_result<T, F, Fut>(config: &RetryConfig, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retriable() && attempt < config.max_retries => {
                attempt += 1;
                let delay = config.delay_for_attempt(attempt);
                debug!(attempt, ?delay, error = %err, "retrying after transient error");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_exponential_without_jitter() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            backoff_multiplier: 10.0,
            jitter_factor: 0.0,
            ..Default::default()
        };
        assert!(config.delay_for_attempt(4) <= Duration::from_secs(5));
    }

    #[test]
    fn test_jittered_delay_in_range() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(1000),
            backoff_multiplier: 1.0,
            jitter_factor: 0.5,
            ..Default::default()
        };
        for _ in 0..32 {
            let d = config.delay_for_attempt(1).as_millis();
            assert!((500..=1500).contains(&d), "delay {d} out of jitter range");
        }
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient() {
        let config = RetryConfig::default()
            .with_max_retries(3)
            .with_initial_delay(Duration::from_millis(1));
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let result = retry_result(&config, || {
            let calls = calls2.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(SluiceError::ConnectionLost)
                } else {
                    Ok(7)
                }
            }
        })
        .await
        .unwrap();

        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_terminal_error_not_retried() {
        let config = RetryConfig::default().with_max_retries(5);
        let calls = Arc::new(AtomicU32::new(0));
        let calls2 = calls.clone();

        let err = retry_result::<(), _, _>(&config, || {
            let calls = calls2.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(SluiceError::decode("bad payload"))
            }
        })
        .await
        .unwrap_err();

        assert!(matches!(err, SluiceError::Decode(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
