use crate::reliability::{BackoffPolicy, RetryStrategy};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the storage peeker backs off while the endpoint keeps failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub strategy: RetryStrategy,
    #[serde(with = "super::serde_helpers")]
    pub base_delay: Duration,
    #[serde(with = "super::serde_helpers")]
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = BackoffPolicy::default();
        Self {
            strategy: policy.strategy,
            base_delay: policy.base_delay,
            max_delay: policy.max_delay,
            jitter: policy.jitter,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            strategy: self.strategy,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            jitter: self.jitter,
        }
    }
}
