use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upper bound on any computed backoff delay.
pub const MAX_BACKOFF_MS: u64 = 30_000;

/// Base delay of the scheduler's exponential backoff.
pub const SCHEDULER_BASE_DELAY_MS: u64 = 1_000;

/// Delay before a workflow step is retried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `base * n`, capped.
    Linear,
    /// `base * 2^(n-1)`, capped.
    #[default]
    Exponential,
    /// Always `base`.
    Fixed,
}

/// Per-workflow retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// How the delay grows between retries.
    #[serde(default)]
    pub backoff_strategy: BackoffStrategy,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_strategy: BackoffStrategy::default(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let n = attempt.max(1);
        let ms = match self.backoff_strategy {
            BackoffStrategy::Exponential => exponential_ms(self.base_delay_ms, n),
            BackoffStrategy::Linear => self
                .base_delay_ms
                .saturating_mul(u64::from(n))
                .min(MAX_BACKOFF_MS),
            BackoffStrategy::Fixed => self.base_delay_ms,
        };
        Duration::from_millis(ms)
    }
}

/// Scheduler backoff before retry number `retries` (1-based): 1s, 2s, 4s, ... capped at 30s.
pub fn scheduler_backoff(retries: u32) -> Duration {
    Duration::from_millis(exponential_ms(SCHEDULER_BASE_DELAY_MS, retries.max(1)))
}

fn exponential_ms(base: u64, n: u32) -> u64 {
    let factor = 2u64.saturating_pow(n - 1);
    base.saturating_mul(factor).min(MAX_BACKOFF_MS)
}
