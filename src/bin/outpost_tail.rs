//! outpost-tail: Logging subscriber
//!
//! Binds a queue to the events exchange and logs every JSON message it
//! receives, then acks it. Useful for watching event flow.
//!
//! ## Configuration
//! - OUTPOST__SUBSCRIBER__EXCHANGE: exchange to bind (default: outpost.events)
//! - OUTPOST__SUBSCRIBER__ROUTING_KEY: binding pattern (default: #)
//! - OUTPOST__SUBSCRIBER__QUEUE: queue name; empty for an exclusive queue
//! - OUTPOST__SUBSCRIBER__PREFETCH: unacked delivery cap (default: 10)

use std::sync::Arc;

use tracing::info;

use outpost::bus::{
    subscribe_json, AckDecision, AmqpBroker, ExchangeSpec, Subscriber, TopologyManager,
};
use outpost::config::Config;
use outpost::utils::bootstrap::{connect_with_retry, init_tracing, shutdown_signal};
use outpost::utils::retry::RetryConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;

    let broker = connect_with_retry("rabbitmq", &RetryConfig::for_reconnect(), || {
        AmqpBroker::connect(config.messaging.amqp.clone())
    })
    .await?;

    // Same declaration the relay makes, so either may start first.
    broker
        .declare_exchange(&ExchangeSpec::topic(config.subscriber.exchange.clone()))
        .await?;

    let subscriber = Subscriber::new(Arc::new(broker)).with_prefetch(config.subscriber.prefetch);
    let handle = subscribe_json(
        &subscriber,
        config.subscriber.binding(),
        |message: serde_json::Value| async move {
            info!(body = %message, "Received");
            AckDecision::Ack
        },
    )
    .await?;

    info!(queue = %handle.queue(), "outpost-tail started");
    shutdown_signal().await;

    handle.shutdown().await;
    Ok(())
}
