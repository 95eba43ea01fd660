//! Application configuration.
//!
//! Loaded from YAML files and `OUTPOST__`-prefixed environment variables,
//! e.g. `OUTPOST__RELAY__INTERVAL_MS=1000`.

mod messaging;

pub use messaging::{AmqpConfig, MessagingConfig};

use std::time::Duration;

use serde::Deserialize;

use crate::bus::topology::{Durability, QueueBinding};
use crate::relay::{RelayConfig, DEFAULT_EXCHANGE};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "OUTPOST_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "OUTPOST";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "OUTPOST_LOG";

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseConfig,
    pub messaging: MessagingConfig,
    pub relay: RelaySettings,
    pub subscriber: SubscriberSettings,
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgres://localhost:5432/outpost".to_string(),
            max_connections: 5,
        }
    }
}

/// Relay settings as written in configuration files.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    /// Durable topic exchange events are published to.
    pub exchange: String,
    pub interval_ms: u64,
    pub batch_size: usize,
    /// Reset events stuck in `pending` for this long. Disabled when unset.
    pub stale_after_secs: Option<u64>,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            interval_ms: 5000,
            batch_size: 1,
            stale_after_secs: None,
        }
    }
}

impl RelaySettings {
    pub fn relay_config(&self) -> RelayConfig {
        let config = RelayConfig::new(self.exchange.clone())
            .with_interval(Duration::from_millis(self.interval_ms.max(1)))
            .with_batch_size(self.batch_size);
        match self.stale_after_secs {
            Some(secs) => config.with_stale_after(Duration::from_secs(secs)),
            None => config,
        }
    }
}

/// Subscription settings for consumer binaries.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SubscriberSettings {
    pub exchange: String,
    /// Empty asks the broker for a generated, exclusive queue.
    pub queue: String,
    pub routing_key: String,
    pub durable: bool,
    pub prefetch: u16,
}

impl Default for SubscriberSettings {
    fn default() -> Self {
        Self {
            exchange: DEFAULT_EXCHANGE.to_string(),
            queue: String::new(),
            routing_key: "#".to_string(),
            durable: false,
            prefetch: 10,
        }
    }
}

impl SubscriberSettings {
    pub fn binding(&self) -> QueueBinding {
        QueueBinding {
            exchange: self.exchange.clone(),
            queue: self.queue.clone(),
            routing_key: self.routing_key.clone(),
            durability: if self.durable {
                Durability::Durable
            } else {
                Durability::Transient
            },
        }
    }
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ::config::ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<Self>()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the relay cannot run safely with.
    ///
    /// `relay.stale_after_secs` must cover one tick interval plus the full
    /// publish budget, otherwise a live relay's claim could be reset while
    /// it is still publishing.
    pub fn validate(&self) -> Result<(), ::config::ConfigError> {
        let Some(secs) = self.relay.stale_after_secs else {
            return Ok(());
        };

        let minimum = self
            .relay
            .relay_config()
            .min_stale_after(self.messaging.amqp.publish_budget());
        if Duration::from_secs(secs) < minimum {
            return Err(::config::ConfigError::Message(format!(
                "relay.stale_after_secs ({}s) must be at least {}ms (interval plus publish budget)",
                secs,
                minimum.as_millis()
            )));
        }
        Ok(())
    }
}
