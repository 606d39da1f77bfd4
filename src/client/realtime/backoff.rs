//! # Reconnect Backoff
//!
//! Computes the delay before the next reconnect attempt from the number of
//! consecutive failures. The default policy reproduces the observed fixed
//! 5-second, unbounded retry; exponential backoff with jitter and an attempt
//! ceiling are available through configuration.

use crate::shared::{BackoffKind, ReconnectConfig};
use std::time::Duration;

/// Delay family
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Fixed interval between retries
    Fixed {
        /// Interval between attempts
        interval: Duration,
    },
    /// Exponential backoff with jitter
    Exponential {
        /// Delay after the first failure
        base: Duration,
        /// Upper bound before jitter
        max: Duration,
        /// Jitter factor (0.0 to 1.0)
        jitter: f64,
    },
}

/// Backoff strategy plus optional attempt ceiling
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub strategy: BackoffStrategy,
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Fixed delay, retry forever
    pub fn fixed(interval: Duration) -> Self {
        Self {
            strategy: BackoffStrategy::Fixed { interval },
            max_attempts: None,
        }
    }

    /// Cap the number of consecutive failed attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay to wait after the `attempt`-th consecutive failure (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        match &self.strategy {
            BackoffStrategy::Fixed { interval } => *interval,
            BackoffStrategy::Exponential { base, max, jitter } => {
                let shift = attempt.saturating_sub(1).min(20);
                let base_ms = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
                let max_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
                let delay_ms = base_ms.saturating_mul(1_u64 << shift).min(max_ms);

                let jitter_ms = (delay_ms as f64 * jitter.clamp(0.0, 1.0)) as u64;
                let extra = if jitter_ms == 0 {
                    0
                } else {
                    rand::random::<u64>() % (jitter_ms + 1)
                };
                Duration::from_millis(delay_ms.saturating_add(extra))
            }
        }
    }

    /// Whether another attempt is allowed after `failures` consecutive failures
    pub fn allows_retry(&self, failures: u32) -> bool {
        self.max_attempts.map_or(true, |max| failures < max)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        ReconnectPolicy::from(&ReconnectConfig::default())
    }
}

impl From<&ReconnectConfig> for ReconnectPolicy {
    fn from(config: &ReconnectConfig) -> Self {
        let base = Duration::from_millis(config.base_delay_ms);
        let strategy = match config.strategy {
            BackoffKind::Fixed => BackoffStrategy::Fixed { interval: base },
            BackoffKind::Exponential => BackoffStrategy::Exponential {
                base,
                max: Duration::from_millis(config.max_delay_ms),
                jitter: config.jitter,
            },
        };
        Self {
            strategy,
            max_attempts: config.max_attempts,
        }
    }
}
