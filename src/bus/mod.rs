//! Message broker layer.
//!
//! This module contains:
//! - `Publisher` trait: sends one message to an exchange under a routing key
//! - `TopologyManager` trait: idempotent exchange/queue/binding declaration
//! - `MessageSource` trait and `Subscriber`: explicit-ack consumption
//! - Typed JSON helpers (`publish_json`, `subscribe_json`)
//! - Implementations: AMQP (RabbitMQ) and an in-process `MemoryBroker`

use async_trait::async_trait;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
pub mod consumer;
pub mod memory;
pub mod pubsub;
pub mod topology;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::{AmqpBroker, AmqpConfig};
pub use consumer::{
    AckDecision, Acknowledger, Decoder, DeliveryOutcome, DeliveryStream, InboundMessage,
    JsonDecoder, MessageHandler, MessageSource, Subscriber, SubscriptionHandle,
};
pub use memory::MemoryBroker;
pub use pubsub::{publish_json, subscribe_json};
pub use topology::{Durability, ExchangeKind, ExchangeSpec, QueueBinding, TopologyManager};

/// Content type for JSON message bodies.
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Broker rejected a declaration (e.g. redeclare with a different type).
    /// Indicates a configuration conflict and is never retried.
    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Decode failed: {0}")]
    Decode(String),

    #[error("Ack failed: {0}")]
    Ack(String),
}

/// A message ready to be handed to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub content_type: String,
    pub body: Vec<u8>,
    /// Persistent delivery mode (survives broker restart on durable queues).
    pub persistent: bool,
    pub message_id: Option<String>,
}

impl OutgoingMessage {
    /// JSON body, persistent delivery.
    pub fn json(body: Vec<u8>) -> Self {
        Self {
            content_type: JSON_CONTENT_TYPE.to_string(),
            body,
            persistent: true,
            message_id: None,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Sends messages to a broker exchange.
///
/// Implementations:
/// - `AmqpBroker`: RabbitMQ via AMQP, with publisher confirms
/// - `MemoryBroker`: in-process broker for tests and local runs
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish one message. Returns only after the broker confirmed it.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()>;
}
