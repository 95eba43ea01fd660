//! Messaging configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::utils::retry::RetryConfig;

/// Messaging configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// AMQP-specific configuration.
    pub amqp: AmqpConfig,
}

/// AMQP connection configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AmqpConfig {
    /// AMQP connection URL (e.g., amqp://localhost:5672).
    pub url: String,
    /// Maximum pooled connections.
    pub pool_size: usize,
    /// Retries after the first failed publish attempt.
    pub publish_retries: usize,
    /// Limit on one publish attempt, confirm included.
    pub publish_timeout_ms: u64,
}

impl Default for AmqpConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            pool_size: 4,
            publish_retries: 2,
            publish_timeout_ms: 10_000,
        }
    }
}

impl AmqpConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn publish_retry(&self) -> RetryConfig {
        RetryConfig::for_publish(self.publish_retries)
    }

    /// Longest a single `publish` call can take: every attempt timing out,
    /// plus the backoff between attempts.
    pub fn publish_budget(&self) -> Duration {
        let attempts = u32::try_from(self.publish_retries.saturating_add(1)).unwrap_or(u32::MAX);
        self.publish_timeout()
            .saturating_mul(attempts)
            .saturating_add(self.publish_retry().max_total_delay())
    }
}
