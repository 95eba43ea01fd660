//! Explicit-ack message consumption.
//!
//! A [`Subscriber`] declares and binds a queue through its [`MessageSource`],
//! applies a prefetch limit and drives a background task that decodes each
//! delivery, hands it to a [`MessageHandler`] and applies the returned
//! [`AckDecision`].
//!
//! Malformed bodies are rejected without requeue: a message that cannot be
//! decoded now never will be, and redelivering it would block the queue.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::topology::QueueBinding;
use super::{BusError, Result};
use crate::utils::retry::RetryConfig;

/// Default unacknowledged-message ceiling per subscription.
pub const DEFAULT_PREFETCH: u16 = 10;

/// What the broker should do with a delivered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckDecision {
    /// Processed; the broker may discard it.
    Ack,
    /// Transient failure; the broker redelivers it.
    NackRequeue,
    /// Permanent failure; the broker drops it.
    NackDiscard,
}

/// Broker-side acknowledgment of a single delivery.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn nack(&self, requeue: bool) -> Result<()>;
}

/// A message received from a bound queue, not yet acknowledged.
pub struct InboundMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    /// Set by the broker when this is not the first delivery attempt.
    pub redelivered: bool,
    pub content_type: Option<String>,
    acker: Box<dyn Acknowledger>,
}

impl InboundMessage {
    pub fn new(
        routing_key: impl Into<String>,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            routing_key: routing_key.into(),
            body,
            redelivered,
            content_type: None,
            acker,
        }
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub async fn ack(&self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn nack(&self, requeue: bool) -> Result<()> {
        self.acker.nack(requeue).await
    }

    async fn settle(&self, decision: AckDecision) -> Result<()> {
        match decision {
            AckDecision::Ack => self.ack().await,
            AckDecision::NackRequeue => self.nack(true).await,
            AckDecision::NackDiscard => self.nack(false).await,
        }
    }
}

impl std::fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InboundMessage")
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<InboundMessage>>;

/// Something that can bind a queue and stream its deliveries.
///
/// Implementations:
/// - `AmqpBroker`: basic.qos + basic.consume with no_ack=false
/// - `MemoryBroker`: in-process queues with per-consumer prefetch credits
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Declare and bind the queue, cap unacknowledged deliveries at
    /// `prefetch` and start consuming.
    ///
    /// Returns the resolved queue name and the delivery stream.
    async fn consume(
        &self,
        binding: &QueueBinding,
        prefetch: u16,
    ) -> Result<(String, DeliveryStream)>;
}

/// Turns a message body into a typed value.
pub trait Decoder<T>: Send + Sync + 'static {
    fn decode(&self, body: &[u8]) -> Result<T>;
}

/// JSON decoder. Unknown fields are ignored.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned + 'static> Decoder<T> for JsonDecoder<T> {
    fn decode(&self, body: &[u8]) -> Result<T> {
        serde_json::from_slice(body).map_err(|e| BusError::Decode(e.to_string()))
    }
}

/// Handler for decoded messages.
///
/// Implemented for any `Fn(T) -> impl Future<Output = AckDecision>`.
pub trait MessageHandler<T>: Send + Sync + 'static {
    fn handle(&self, message: T) -> BoxFuture<'static, AckDecision>;
}

impl<T, F, Fut> MessageHandler<T> for F
where
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = AckDecision> + Send + 'static,
{
    fn handle(&self, message: T) -> BoxFuture<'static, AckDecision> {
        Box::pin(self(message))
    }
}

/// How a single delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Acked,
    Requeued,
    Discarded,
    /// Body could not be decoded; rejected without requeue.
    Dropped,
    /// The broker-level ack/nack call itself failed.
    AckFailed,
}

impl From<AckDecision> for DeliveryOutcome {
    fn from(decision: AckDecision) -> Self {
        match decision {
            AckDecision::Ack => DeliveryOutcome::Acked,
            AckDecision::NackRequeue => DeliveryOutcome::Requeued,
            AckDecision::NackDiscard => DeliveryOutcome::Discarded,
        }
    }
}

/// Decode one delivery, run the handler and settle it with the broker.
///
/// Never fails: every failure is logged and reported through the outcome so
/// the consume loop keeps going.
pub async fn process_delivery<T, D, H>(
    message: InboundMessage,
    decoder: &D,
    handler: &H,
) -> DeliveryOutcome
where
    D: Decoder<T> + ?Sized,
    H: MessageHandler<T> + ?Sized,
{
    let decoded = match decoder.decode(&message.body) {
        Ok(value) => value,
        Err(e) => {
            error!(
                routing_key = %message.routing_key,
                redelivered = message.redelivered,
                error = %e,
                "Failed to decode message, dropping without requeue"
            );
            return match message.nack(false).await {
                Ok(()) => DeliveryOutcome::Dropped,
                Err(ack_err) => {
                    error!(error = %ack_err, "Failed to reject undecodable message");
                    DeliveryOutcome::AckFailed
                }
            };
        }
    };

    let decision = handler.handle(decoded).await;
    debug!(routing_key = %message.routing_key, ?decision, "Handler finished");

    match message.settle(decision).await {
        Ok(()) => decision.into(),
        Err(e) => {
            error!(
                routing_key = %message.routing_key,
                ?decision,
                error = %e,
                "Failed to settle message"
            );
            DeliveryOutcome::AckFailed
        }
    }
}

/// Binds queues and runs one consume task per subscription.
#[derive(Clone)]
pub struct Subscriber {
    source: Arc<dyn MessageSource>,
    prefetch: u16,
    reconnect: RetryConfig,
}

impl Subscriber {
    pub fn new(source: Arc<dyn MessageSource>) -> Self {
        Self {
            source,
            prefetch: DEFAULT_PREFETCH,
            reconnect: RetryConfig::for_reconnect(),
        }
    }

    /// Cap on unacknowledged deliveries. Zero is treated as one.
    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_reconnect(mut self, reconnect: RetryConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn prefetch(&self) -> u16 {
        self.prefetch
    }

    /// Bind `binding` and start delivering decoded messages to `handler`.
    ///
    /// Declaration and consume errors are returned here and are not retried.
    /// Once running, a lost delivery stream is re-established with backoff.
    /// The subscription runs until the returned handle is stopped or dropped.
    pub async fn subscribe<T, D, H>(
        &self,
        binding: QueueBinding,
        decoder: D,
        handler: H,
    ) -> Result<SubscriptionHandle>
    where
        T: Send + 'static,
        D: Decoder<T>,
        H: MessageHandler<T>,
    {
        let (queue, stream) = self.source.consume(&binding, self.prefetch).await?;

        info!(
            exchange = %binding.exchange,
            queue = %queue,
            routing_key = %binding.routing_key,
            prefetch = self.prefetch,
            "Subscription started"
        );

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = watch::channel(queue);
        let worker = ConsumeLoop {
            source: Arc::clone(&self.source),
            binding,
            queue: queue_tx,
            prefetch: self.prefetch,
            reconnect: self.reconnect.clone(),
            decoder,
            handler,
            _marker: PhantomData,
        };
        let task = tokio::spawn(worker.run(stream, cancel_rx));

        Ok(SubscriptionHandle {
            queue: queue_rx,
            cancel: cancel_tx,
            task,
        })
    }
}

struct ConsumeLoop<T, D, H> {
    source: Arc<dyn MessageSource>,
    binding: QueueBinding,
    /// Queue currently consumed from; changes when a generated queue is
    /// redeclared on reconnect.
    queue: watch::Sender<String>,
    prefetch: u16,
    reconnect: RetryConfig,
    decoder: D,
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T, D, H> ConsumeLoop<T, D, H>
where
    T: Send + 'static,
    D: Decoder<T>,
    H: MessageHandler<T>,
{
    async fn run(self, mut stream: DeliveryStream, mut cancel: watch::Receiver<bool>) {
        loop {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.changed() => {
                        info!(routing_key = %self.binding.routing_key, "Subscription stopped");
                        return;
                    }
                    next = stream.next() => match next {
                        Some(Ok(message)) => {
                            let span = info_span!("bus.consume", routing_key = %message.routing_key);
                            process_delivery(message, &self.decoder, &self.handler)
                                .instrument(span)
                                .await;
                        }
                        Some(Err(e)) => {
                            error!(error = %e, "Delivery stream failed, will reconnect");
                            break;
                        }
                        None => {
                            warn!(routing_key = %self.binding.routing_key, "Delivery stream ended, reconnecting");
                            break;
                        }
                    }
                }
            }

            match self.reconnect_stream(&mut cancel).await {
                Some((queue, next)) => {
                    self.queue.send_replace(queue);
                    stream = next;
                }
                None => return,
            }
        }
    }

    /// Re-open the subscription with backoff. Returns `None` when cancelled.
    async fn reconnect_stream(
        &self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Option<(String, DeliveryStream)> {
        let mut backoff = self.reconnect.backoff();

        loop {
            let delay = backoff.next().unwrap_or(self.reconnect.max_delay);
            tokio::select! {
                biased;
                _ = cancel.changed() => {
                    info!(routing_key = %self.binding.routing_key, "Subscription stopped while reconnecting");
                    return None;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self.source.consume(&self.binding, self.prefetch).await {
                Ok((queue, stream)) => {
                    if *self.queue.borrow() != queue {
                        warn!(
                            previous = %*self.queue.borrow(),
                            queue = %queue,
                            "Subscription moved to a new queue"
                        );
                    }
                    info!(queue = %queue, "Subscription re-established");
                    return Some((queue, stream));
                }
                Err(e) => {
                    error!(
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Failed to re-establish subscription, retrying after backoff"
                    );
                }
            }
        }
    }
}

/// Handle to a running subscription.
///
/// Dropping the handle stops the subscription.
pub struct SubscriptionHandle {
    queue: watch::Receiver<String>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SubscriptionHandle {
    /// Queue the subscription currently consumes from.
    ///
    /// A broker-assigned queue is deleted with its connection, so after a
    /// reconnect this names the queue declared in its place.
    pub fn queue(&self) -> String {
        self.queue.borrow().clone()
    }

    /// Signal the consume task to stop after the in-flight delivery.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the consume task to exit.
    pub async fn join(self) {
        let SubscriptionHandle { cancel, task, .. } = self;
        if let Err(e) = task.await {
            error!(error = %e, "Subscription task failed");
        }
        drop(cancel);
    }

    /// Stop and wait for the consume task to exit.
    pub async fn shutdown(self) {
        self.stop();
        self.join().await;
    }
}
