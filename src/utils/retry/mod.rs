//! Retry utilities with exponential backoff, cap, and jitter.
//!
//! Wraps `backon`'s exponential builder so publish retries and subscription
//! reconnects share one configuration shape.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBackoff, ExponentialBuilder};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Delay before the first retry (before jitter).
    pub base_delay: Duration,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Maximum number of retries. `None` retries forever.
    pub max_retries: Option<usize>,
    /// Add random jitter to each delay to avoid thundering herd.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_retries: Some(5),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Bounded retries for a single publish.
    ///
    /// - Base delay: 100ms
    /// - Max delay: 5s
    /// - Jitter: on
    pub fn for_publish(max_retries: usize) -> Self {
        Self {
            max_retries: Some(max_retries),
            ..Self::default()
        }
    }

    /// Unbounded retries for re-establishing a lost subscription.
    ///
    /// - Base delay: 100ms
    /// - Max delay: 30s
    /// - Jitter: on
    pub fn for_reconnect() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            max_retries: None,
            jitter: true,
        }
    }

    /// Fixed-shape config for tests: tiny delays, no jitter.
    pub fn immediate(max_retries: Option<usize>) -> Self {
        Self {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            max_retries,
            jitter: false,
        }
    }

    pub fn builder(&self) -> ExponentialBuilder {
        let builder = ExponentialBuilder::default()
            .with_min_delay(self.base_delay)
            .with_max_delay(self.max_delay)
            .with_max_times(self.max_retries.unwrap_or(usize::MAX));
        if self.jitter {
            builder.with_jitter()
        } else {
            builder
        }
    }

    /// Iterator of delays, one per retry.
    pub fn backoff(&self) -> ExponentialBackoff {
        self.builder().build()
    }

    /// Upper bound on the total time spent sleeping between retries.
    ///
    /// Jitter can add up to one extra delay per retry. `Duration::MAX` when
    /// retries are unbounded.
    pub fn max_total_delay(&self) -> Duration {
        let Some(retries) = self.max_retries else {
            return Duration::MAX;
        };

        let mut total = Duration::ZERO;
        let mut delay = self.base_delay;
        for _ in 0..retries {
            let capped = delay.min(self.max_delay);
            let step = if self.jitter {
                capped.saturating_mul(2)
            } else {
                capped
            };
            total = total.saturating_add(step);
            delay = delay.saturating_mul(2);
        }
        total
    }
}
