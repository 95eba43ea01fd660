//! AMQP (RabbitMQ) broker implementation.
//!
//! One `AmqpBroker` owns a deadpool-lapin connection pool. Publishes go
//! through a cached confirm-mode channel; every consumer and every
//! declaration gets a channel of its own, so a broker-side channel error
//! (e.g. an inequivalent redeclare) never takes down unrelated work.

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use deadpool_lapin::{Manager, Pool, PoolError};
use futures::{Stream, StreamExt};
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
        BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    BasicProperties, Channel,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use super::consumer::{Acknowledger, DeliveryStream, InboundMessage, MessageSource};
use super::topology::{ExchangeKind, ExchangeSpec, QueueBinding, TopologyManager};
use super::{BusError, OutgoingMessage, Publisher, Result};
pub use crate::config::AmqpConfig;
use crate::utils::retry::RetryConfig;

/// Persistent delivery mode.
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// RabbitMQ broker: publisher, topology manager and message source.
pub struct AmqpBroker {
    pool: Pool,
    config: AmqpConfig,
    publish_channel: Mutex<Option<Channel>>,
}

impl AmqpBroker {
    /// Build the pool and verify the broker is reachable.
    pub async fn connect(config: AmqpConfig) -> Result<Self> {
        let manager = Manager::new(config.url.clone(), Default::default());
        let pool = Pool::builder(manager)
            .max_size(config.pool_size.max(1))
            .build()
            .map_err(|e| BusError::Connection(format!("Failed to create pool: {}", e)))?;

        let broker = Self {
            pool,
            config,
            publish_channel: Mutex::new(None),
        };

        // Verify connection
        broker.channel().await?;

        info!(url = %broker.config.url, "Connected to AMQP");
        Ok(broker)
    }

    pub fn config(&self) -> &AmqpConfig {
        &self.config
    }

    /// Get a fresh channel from the pool.
    async fn channel(&self) -> Result<Channel> {
        let conn = self.pool.get().await.map_err(|e: PoolError| {
            BusError::Connection(format!("Failed to get connection from pool: {}", e))
        })?;

        conn.create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))
    }

    /// Cached confirm-mode channel for publishing, reopened when closed.
    async fn publish_channel(&self) -> Result<Channel> {
        let mut cached = self.publish_channel.lock().await;
        if let Some(channel) = cached.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
        }

        let channel = self.channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable confirms: {}", e)))?;
        *cached = Some(channel.clone());
        Ok(channel)
    }

    async fn invalidate_publish_channel(&self) {
        self.publish_channel.lock().await.take();
    }

    async fn publish_once(
        &self,
        exchange: &str,
        routing_key: &str,
        message: &OutgoingMessage,
    ) -> Result<()> {
        let channel = self.publish_channel().await?;

        let mut properties =
            BasicProperties::default().with_content_type(message.content_type.as_str().into());
        if message.persistent {
            properties = properties.with_delivery_mode(DELIVERY_MODE_PERSISTENT);
        }
        if let Some(id) = &message.message_id {
            properties = properties.with_message_id(id.as_str().into());
        }

        let confirm = channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;
        if confirmation.is_nack() {
            return Err(BusError::Publish("Broker nacked the publish".to_string()));
        }
        Ok(())
    }
}

fn lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
    }
}

fn exchange_options(spec: &ExchangeSpec) -> ExchangeDeclareOptions {
    let flags = spec.durability.exchange_flags();
    ExchangeDeclareOptions {
        durable: flags.durable,
        auto_delete: flags.auto_delete,
        ..Default::default()
    }
}

fn queue_options(binding: &QueueBinding) -> QueueDeclareOptions {
    let flags = binding.durability.queue_flags();
    QueueDeclareOptions {
        durable: flags.durable,
        auto_delete: flags.auto_delete,
        exclusive: flags.exclusive,
        ..Default::default()
    }
}

/// Declare the queue and bind it on `channel`. Returns the resolved name.
async fn declare_and_bind(channel: &Channel, binding: &QueueBinding) -> Result<String> {
    let queue = channel
        .queue_declare(&binding.queue, queue_options(binding), FieldTable::default())
        .await
        .map_err(|e| {
            BusError::Topology(format!("Failed to declare queue '{}': {}", binding.queue, e))
        })?;
    let name = queue.name().as_str().to_string();

    channel
        .queue_bind(
            &name,
            &binding.exchange,
            &binding.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Topology(format!("Failed to bind queue '{}': {}", name, e)))?;

    info!(
        exchange = %binding.exchange,
        queue = %name,
        routing_key = %binding.routing_key,
        "Bound queue to exchange"
    );
    Ok(name)
}

#[async_trait]
impl Publisher for AmqpBroker {
    #[tracing::instrument(name = "bus.publish", skip_all, fields(exchange = %exchange, routing_key = %routing_key))]
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()> {
        let retry = self.config.publish_retry();
        let timeout = self.config.publish_timeout();
        let max_attempts = self.config.publish_retries + 1;
        let mut last_error = None;

        for (attempt, delay) in std::iter::once(std::time::Duration::ZERO)
            .chain(retry.backoff())
            .enumerate()
        {
            if attempt > 0 {
                tokio::time::sleep(delay).await;
            }

            let attempt_result =
                tokio::time::timeout(timeout, self.publish_once(exchange, routing_key, &message))
                    .await
                    .unwrap_or_else(|_| {
                        Err(BusError::Publish(format!(
                            "Publish timed out after {}ms",
                            timeout.as_millis()
                        )))
                    });

            match attempt_result {
                Ok(()) => {
                    debug!(exchange, routing_key, "Published message");
                    return Ok(());
                }
                Err(e) => {
                    error!(
                        attempt = attempt + 1,
                        max_attempts,
                        error = %e,
                        "Publish failed"
                    );
                    // Channel errors close the channel; start fresh next attempt.
                    self.invalidate_publish_channel().await;
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| BusError::Publish("Max retries exceeded".to_string())))
    }
}

#[async_trait]
impl TopologyManager for AmqpBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let channel = self.channel().await?;
        channel
            .exchange_declare(
                &spec.name,
                lapin_kind(spec.kind),
                exchange_options(spec),
                FieldTable::default(),
            )
            .await
            .map_err(|e| {
                BusError::Topology(format!("Failed to declare exchange '{}': {}", spec.name, e))
            })?;

        info!(exchange = %spec.name, kind = %spec.kind, durable = spec.durability.is_durable(), "Declared exchange");
        Ok(())
    }

    async fn declare_and_bind_queue(&self, binding: &QueueBinding) -> Result<String> {
        let channel = self.channel().await?;
        declare_and_bind(&channel, binding).await
    }
}

#[async_trait]
impl MessageSource for AmqpBroker {
    async fn consume(
        &self,
        binding: &QueueBinding,
        prefetch: u16,
    ) -> Result<(String, DeliveryStream)> {
        let channel = self.channel().await?;
        let queue = declare_and_bind(&channel, binding).await?;

        channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to set prefetch: {}", e)))?;

        let consumer = channel
            .basic_consume(
                &queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Subscribe(format!("Failed to start consumer: {}", e)))?;

        let stream = AmqpDeliveryStream {
            consumer,
            _channel: channel,
        };
        Ok((queue, stream.boxed()))
    }
}

/// Consumer stream that keeps its channel open while it lives.
struct AmqpDeliveryStream {
    consumer: lapin::Consumer,
    _channel: Channel,
}

impl Stream for AmqpDeliveryStream {
    type Item = Result<InboundMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.consumer.poll_next_unpin(cx).map(|next| {
            next.map(|delivery| {
                delivery
                    .map(inbound_message)
                    .map_err(|e| BusError::Subscribe(format!("Consumer delivery error: {}", e)))
            })
        })
    }
}

fn inbound_message(delivery: Delivery) -> InboundMessage {
    let content_type = delivery
        .properties
        .content_type()
        .as_ref()
        .map(|ct| ct.to_string());
    let message = InboundMessage::new(
        delivery.routing_key.as_str(),
        delivery.data,
        delivery.redelivered,
        Box::new(LapinAcknowledger(delivery.acker)),
    );
    match content_type {
        Some(ct) => message.with_content_type(ct),
        None => message,
    }
}

struct LapinAcknowledger(lapin::acker::Acker);

#[async_trait]
impl Acknowledger for LapinAcknowledger {
    async fn ack(&self) -> Result<()> {
        self.0
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BusError::Ack(format!("Failed to ack message: {}", e)))
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        let result = if requeue {
            self.0
                .nack(BasicNackOptions {
                    requeue: true,
                    ..Default::default()
                })
                .await
        } else {
            // Don't requeue: reject drops (or dead-letters) the message.
            self.0
                .reject(BasicRejectOptions { requeue: false })
                .await
        };
        result
            .map(|_| ())
            .map_err(|e| BusError::Ack(format!("Failed to nack message: {}", e)))
    }
}
