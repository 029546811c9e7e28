use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    ExponentialBackoff,
    LinearBackoff,
    FixedDelay,
}

#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub strategy: RetryStrategy,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            strategy: RetryStrategy::ExponentialBackoff,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            jitter: true,
        }
    }
}

impl BackoffPolicy {
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base_millis = self.base_delay.as_millis() as u64;
        let delay = match self.strategy {
            RetryStrategy::ExponentialBackoff => {
                let multiplier = 2_u64.saturating_pow(attempt.min(32));
                Duration::from_millis(base_millis.saturating_mul(multiplier))
            }
            RetryStrategy::LinearBackoff => {
                Duration::from_millis(base_millis.saturating_mul(attempt as u64 + 1))
            }
            RetryStrategy::FixedDelay => self.base_delay,
        };

        let capped = delay.min(self.max_delay);

        if self.jitter {
            apply_jitter(capped)
        } else {
            capped
        }
    }

    /// How long the peeker waits before its next pass.
    pub fn next_delay(&self, interval: Duration, state: &BackoffState) -> Duration {
        let failures = state.consecutive_failures();
        let mut delay = if failures == 0 {
            interval
        } else {
            interval.max(self.calculate_delay(failures - 1))
        };

        if let Some(retry_after) = state.retry_after_remaining() {
            delay = delay.max(retry_after);
        }

        delay
    }
}

fn apply_jitter(delay: Duration) -> Duration {
    let mut rng = rand::rng();
    let jitter_factor = rng.random_range(0.5..1.5); // ±50% jitter
    let jittered_millis = (delay.as_millis() as f64 * jitter_factor) as u64;
    Duration::from_millis(jittered_millis)
}

/// Health of the ingestion endpoint as seen by the sender.
#[derive(Debug, Default)]
pub struct BackoffState {
    consecutive_failures: AtomicU32,
    retry_after_until: Mutex<Option<Instant>>,
}

impl BackoffState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.retry_after_until.lock() = None;
    }

    pub fn record_transient(&self, retry_after: Option<Duration>) {
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
        if let Some(retry_after) = retry_after {
            let until = Instant::now() + retry_after;
            let mut current = self.retry_after_until.lock();
            if current.is_none_or(|existing| existing < until) {
                *current = Some(until);
            }
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    pub fn retry_after_remaining(&self) -> Option<Duration> {
        let until = (*self.retry_after_until.lock())?;
        let remaining = until.saturating_duration_since(Instant::now());
        (!remaining.is_zero()).then_some(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(strategy: RetryStrategy) -> BackoffPolicy {
        BackoffPolicy {
            strategy,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: false,
        }
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let policy = policy(RetryStrategy::ExponentialBackoff);

        assert_eq!(policy.calculate_delay(0), Duration::from_millis(100));
        assert_eq!(policy.calculate_delay(2), Duration::from_millis(400));
        assert_eq!(policy.calculate_delay(10), Duration::from_secs(1));
        assert_eq!(policy.calculate_delay(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_linear_and_fixed_delay() {
        assert_eq!(
            policy(RetryStrategy::LinearBackoff).calculate_delay(2),
            Duration::from_millis(300)
        );
        assert_eq!(
            policy(RetryStrategy::FixedDelay).calculate_delay(7),
            Duration::from_millis(100)
        );
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = BackoffPolicy {
            jitter: true,
            ..policy(RetryStrategy::FixedDelay)
        };

        for _ in 0..100 {
            let delay = policy.calculate_delay(0);
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }

    #[test]
    fn test_next_delay_grows_with_failures_and_resets() {
        let policy = policy(RetryStrategy::ExponentialBackoff);
        let state = BackoffState::new();
        let interval = Duration::from_millis(50);

        assert_eq!(policy.next_delay(interval, &state), interval);

        state.record_transient(None);
        state.record_transient(None);
        assert_eq!(policy.next_delay(interval, &state), Duration::from_millis(200));

        state.record_success();
        assert_eq!(policy.next_delay(interval, &state), interval);
    }

    #[test]
    fn test_retry_after_extends_delay() {
        let policy = policy(RetryStrategy::FixedDelay);
        let state = BackoffState::new();

        state.record_transient(Some(Duration::from_secs(30)));

        assert!(policy.next_delay(Duration::from_millis(10), &state) > Duration::from_secs(29));
    }
}
