//! Typed JSON publish/subscribe.
//!
//! Thin layer over [`Publisher`] and [`Subscriber`]: values are serialized
//! with serde_json on the way out and decoded into `T` on the way in. The
//! acknowledgment contract is the consumer's.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use super::consumer::{JsonDecoder, MessageHandler, Subscriber, SubscriptionHandle};
use super::topology::QueueBinding;
use super::{BusError, OutgoingMessage, Publisher, Result};

/// Serialize `value` as JSON and publish it persistently.
pub async fn publish_json<T>(
    publisher: &dyn Publisher,
    exchange: &str,
    routing_key: &str,
    value: &T,
) -> Result<()>
where
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value)
        .map_err(|e| BusError::Publish(format!("Failed to encode JSON body: {}", e)))?;

    debug!(exchange, routing_key, bytes = body.len(), "Publishing JSON message");
    publisher
        .publish(exchange, routing_key, OutgoingMessage::json(body))
        .await
}

/// Subscribe `handler` to JSON messages decoded as `T`.
///
/// Bodies that fail to decode are dropped without requeue.
pub async fn subscribe_json<T, H>(
    subscriber: &Subscriber,
    binding: QueueBinding,
    handler: H,
) -> Result<SubscriptionHandle>
where
    T: DeserializeOwned + Send + 'static,
    H: MessageHandler<T>,
{
    subscriber
        .subscribe(binding, JsonDecoder::<T>::new(), handler)
        .await
}
