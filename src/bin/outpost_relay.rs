//! outpost-relay: Outbox relay
//!
//! Polls the PostgreSQL outbox and publishes each event to a RabbitMQ topic
//! exchange under `{domain}.{event_type}`.
//!
//! ## Architecture
//! ```text
//! [domain service] --(tx: row + outbox)--> [postgres]
//!                                              |
//!                                        outpost-relay
//!                                              |
//!                                              v
//!                                   [rabbitmq topic exchange]
//! ```
//!
//! ## Configuration
//! - OUTPOST_CONFIG: Path to a YAML config file (optional)
//! - OUTPOST__DATABASE__URL, OUTPOST__MESSAGING__AMQP__URL, OUTPOST__RELAY__*
//! - OUTPOST_LOG: tracing filter (default: info)

use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing::info;

use outpost::bus::AmqpBroker;
use outpost::config::Config;
use outpost::relay::OutboxRelay;
use outpost::storage::PostgresOutboxStore;
use outpost::utils::bootstrap::{connect_with_retry, init_tracing, shutdown_signal};
use outpost::utils::retry::RetryConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = Config::load(config_path.as_deref())?;
    // Dependencies may come up after us; wait for them with the reconnect curve.
    let retry = RetryConfig::for_reconnect();

    let pool = connect_with_retry("postgres", &retry, || {
        PgPoolOptions::new()
            .max_connections(config.database.max_connections)
            .connect(&config.database.url)
    })
    .await?;

    let store = PostgresOutboxStore::new(pool);
    store.init().await?;

    let broker = Arc::new(
        connect_with_retry("rabbitmq", &retry, || {
            AmqpBroker::connect(config.messaging.amqp.clone())
        })
        .await?,
    );

    let relay = OutboxRelay::new(
        Arc::new(store),
        broker.clone(),
        broker,
        config.relay.relay_config(),
    );
    let handle = relay.start().await?;

    info!("outpost-relay started");
    shutdown_signal().await;

    handle.shutdown().await;
    info!("outpost-relay stopped");
    Ok(())
}
