//! Broker topology: exchanges, queues and bindings.
//!
//! Declarations are idempotent. Redeclaring an entity with different
//! properties is a configuration conflict and surfaces as
//! [`BusError::Topology`](super::BusError::Topology).

use std::fmt;

use async_trait::async_trait;
use serde::Deserialize;

use super::Result;

/// Durability class for exchanges and queues.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Durability {
    /// Survives broker restart, never auto-deleted.
    #[default]
    Durable,
    /// Auto-deleted when unused. Transient queues are also exclusive to the
    /// declaring connection.
    Transient,
}

/// Flags an exchange is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeFlags {
    pub durable: bool,
    pub auto_delete: bool,
}

/// Flags a queue is declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFlags {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

impl Durability {
    pub fn is_durable(self) -> bool {
        self == Durability::Durable
    }

    pub fn exchange_flags(self) -> ExchangeFlags {
        ExchangeFlags {
            durable: self.is_durable(),
            auto_delete: !self.is_durable(),
        }
    }

    pub fn queue_flags(self) -> QueueFlags {
        QueueFlags {
            durable: self.is_durable(),
            auto_delete: !self.is_durable(),
            exclusive: !self.is_durable(),
        }
    }
}

/// Exchange routing algorithm.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Direct,
    Fanout,
    #[default]
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durability: Durability,
}

impl ExchangeSpec {
    /// Durable topic exchange, the shape every outbox event is published to.
    pub fn topic(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: ExchangeKind::Topic,
            durability: Durability::Durable,
        }
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }
}

/// Queue declaration plus its binding to an exchange.
///
/// An empty `queue` asks the broker to assign a name, which gives every
/// consumer instance its own exclusive queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub exchange: String,
    pub queue: String,
    /// Binding pattern. For topic exchanges `*` matches one word and `#`
    /// matches zero or more words.
    pub routing_key: String,
    pub durability: Durability,
}

impl QueueBinding {
    /// Named durable queue.
    pub fn durable(
        exchange: impl Into<String>,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            queue: queue.into(),
            routing_key: routing_key.into(),
            durability: Durability::Durable,
        }
    }

    /// Broker-named, exclusive, auto-delete queue.
    pub fn exclusive(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            queue: String::new(),
            routing_key: routing_key.into(),
            durability: Durability::Transient,
        }
    }
}

/// Declares broker topology.
///
/// Implementations:
/// - `AmqpBroker`: exchange.declare / queue.declare / queue.bind over lapin
/// - `MemoryBroker`: in-process equivalent with the same conflict rules
#[async_trait]
pub trait TopologyManager: Send + Sync {
    /// Declare an exchange. Idempotent for identical declarations.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    /// Declare a queue and bind it to `binding.exchange`.
    ///
    /// Returns the resolved queue name.
    async fn declare_and_bind_queue(&self, binding: &QueueBinding) -> Result<String>;
}

/// Check if a routing key matches a topic binding pattern.
///
/// Words are separated by `.`; `*` matches exactly one word, `#` matches
/// zero or more words.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}
