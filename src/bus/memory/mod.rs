//! In-process message broker.
//!
//! `MemoryBroker` models the parts of AMQP 0-9-1 the crate relies on:
//! durable/transient exchanges and queues with redeclare conflicts, topic,
//! direct and fanout routing, broker-named queues, per-consumer prefetch
//! credits, ack / nack-requeue / nack-discard, requeue of unacknowledged
//! messages when a consumer goes away, and auto-delete of transient queues.
//!
//! Useful for local runs and for exercising delivery semantics in tests
//! without a RabbitMQ server.

use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use tracing::{debug, info, warn};

use super::consumer::{Acknowledger, DeliveryStream, InboundMessage, MessageSource};
use super::topology::{
    topic_matches, Durability, ExchangeKind, ExchangeSpec, QueueBinding, TopologyManager,
};
use super::{BusError, OutgoingMessage, Publisher, Result};

/// Prefix for broker-assigned queue names, as RabbitMQ does.
const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

#[derive(Debug, Clone)]
struct StoredMessage {
    routing_key: String,
    body: Vec<u8>,
    content_type: String,
    redelivered: bool,
}

struct Exchange {
    kind: ExchangeKind,
    durability: Durability,
    /// (queue, binding pattern)
    bindings: Vec<(String, String)>,
}

impl Exchange {
    fn routes(&self, routing_key: &str) -> Vec<String> {
        let mut queues: Vec<String> = Vec::new();
        for (queue, pattern) in &self.bindings {
            let matched = match self.kind {
                ExchangeKind::Topic => topic_matches(pattern, routing_key),
                ExchangeKind::Direct => pattern == routing_key,
                ExchangeKind::Fanout => true,
                // Header matching needs message headers, which are not modelled.
                ExchangeKind::Headers => false,
            };
            if matched && !queues.contains(queue) {
                queues.push(queue.clone());
            }
        }
        queues
    }
}

struct ConsumerSlot {
    id: u64,
    prefetch: usize,
    in_flight: usize,
    tx: mpsc::UnboundedSender<Result<InboundMessage>>,
}

struct Unacked {
    consumer: u64,
    message: StoredMessage,
}

struct Queue {
    durability: Durability,
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, Unacked>,
    consumers: Vec<ConsumerSlot>,
    cursor: usize,
}

impl Queue {
    fn new(durability: Durability) -> Self {
        Self {
            durability,
            ready: VecDeque::new(),
            unacked: HashMap::new(),
            consumers: Vec::new(),
            cursor: 0,
        }
    }

    /// Return a consumer's unacknowledged messages to the front of the queue.
    fn requeue_consumer(&mut self, consumer: u64) -> usize {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, u)| u.consumer == consumer)
            .map(|(tag, _)| *tag)
            .collect();
        // Highest tag first so the oldest ends up at the front.
        tags.sort_unstable_by(|a, b| b.cmp(a));
        for tag in &tags {
            if let Some(entry) = self.unacked.remove(tag) {
                let mut message = entry.message;
                message.redelivered = true;
                self.ready.push_front(message);
            }
        }
        tags.len()
    }
}

#[derive(Default)]
struct State {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Queue>,
    next_tag: u64,
    next_consumer: u64,
    unreachable: bool,
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl State {
    fn declare_exchange(&mut self, spec: &ExchangeSpec) -> Result<()> {
        if let Some(existing) = self.exchanges.get(&spec.name) {
            if existing.kind != spec.kind || existing.durability != spec.durability {
                return Err(BusError::Topology(format!(
                    "inequivalent arguments for exchange '{}': declared {} {:?}, requested {} {:?}",
                    spec.name, existing.kind, existing.durability, spec.kind, spec.durability
                )));
            }
            return Ok(());
        }
        self.exchanges.insert(
            spec.name.clone(),
            Exchange {
                kind: spec.kind,
                durability: spec.durability,
                bindings: Vec::new(),
            },
        );
        Ok(())
    }

    fn declare_and_bind(&mut self, binding: &QueueBinding) -> Result<String> {
        if !self.exchanges.contains_key(&binding.exchange) {
            return Err(BusError::Topology(format!(
                "no exchange '{}' to bind to",
                binding.exchange
            )));
        }

        let name = if binding.queue.is_empty() {
            format!("{}{}", GENERATED_QUEUE_PREFIX, uuid::Uuid::new_v4().simple())
        } else {
            binding.queue.clone()
        };

        match self.queues.get(&name) {
            Some(existing) if existing.durability != binding.durability => {
                return Err(BusError::Topology(format!(
                    "inequivalent arguments for queue '{}': declared {:?}, requested {:?}",
                    name, existing.durability, binding.durability
                )));
            }
            Some(_) => {}
            None => {
                self.queues.insert(name.clone(), Queue::new(binding.durability));
            }
        }

        if let Some(exchange) = self.exchanges.get_mut(&binding.exchange) {
            let entry = (name.clone(), binding.routing_key.clone());
            if !exchange.bindings.contains(&entry) {
                exchange.bindings.push(entry);
            }
        }

        Ok(name)
    }

    fn delete_queue(&mut self, name: &str) {
        self.queues.remove(name);
        let mut emptied = Vec::new();
        for (exchange_name, exchange) in self.exchanges.iter_mut() {
            let before = exchange.bindings.len();
            exchange.bindings.retain(|(queue, _)| queue != name);
            if before > 0
                && exchange.bindings.is_empty()
                && exchange.durability == Durability::Transient
            {
                emptied.push(exchange_name.clone());
            }
        }
        for exchange in emptied {
            debug!(exchange = %exchange, "Auto-deleting exchange");
            self.exchanges.remove(&exchange);
        }
    }

    /// Hand ready messages to consumers with spare prefetch credit.
    fn dispatch(&mut self, shared: &Arc<Mutex<State>>, queue_name: &str) {
        loop {
            let Some(queue) = self.queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let start = queue.cursor % count;
            let Some(idx) = (0..count)
                .map(|offset| (start + offset) % count)
                .find(|&i| queue.consumers[i].in_flight < queue.consumers[i].prefetch)
            else {
                return;
            };

            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            self.next_tag += 1;
            let tag = self.next_tag;

            let inbound = InboundMessage::new(
                message.routing_key.clone(),
                message.body.clone(),
                message.redelivered,
                Box::new(MemoryAcker {
                    state: Arc::downgrade(shared),
                    queue: queue_name.to_string(),
                    tag,
                }),
            )
            .with_content_type(message.content_type.clone());

            if queue.consumers[idx].tx.unbounded_send(Ok(inbound)).is_err() {
                // Receiver went away without cancelling; forget the consumer.
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                continue;
            }

            let consumer = &mut queue.consumers[idx];
            consumer.in_flight += 1;
            let consumer_id = consumer.id;
            queue.cursor = idx + 1;
            queue.unacked.insert(
                tag,
                Unacked {
                    consumer: consumer_id,
                    message,
                },
            );
        }
    }

    fn cancel_consumer(&mut self, shared: &Arc<Mutex<State>>, queue_name: &str, consumer: u64) {
        let Some(queue) = self.queues.get_mut(queue_name) else {
            return;
        };
        let before = queue.consumers.len();
        queue.consumers.retain(|c| c.id != consumer);
        let requeued = queue.requeue_consumer(consumer);
        if requeued > 0 {
            debug!(queue = %queue_name, requeued, "Requeued unacknowledged messages");
        }

        let last_left = before > 0 && queue.consumers.is_empty();
        if last_left && queue.durability == Durability::Transient {
            debug!(queue = %queue_name, "Auto-deleting queue");
            self.delete_queue(queue_name);
        } else {
            self.dispatch(shared, queue_name);
        }
    }
}

/// In-process broker implementing [`Publisher`], [`TopologyManager`] and
/// [`MessageSource`].
///
/// Cloning shares the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: publishes, declarations and new consumers fail
    /// with a connection error until cleared.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Drop every consumer as if the connection was lost.
    ///
    /// Unacknowledged messages are requeued, exclusive queues are deleted and
    /// the consumers' delivery streams end.
    pub fn sever_connections(&self) {
        let mut state = lock(&self.state);
        let queue_names: Vec<String> = state.queues.keys().cloned().collect();
        for name in queue_names {
            let consumers: Vec<u64> = state
                .queues
                .get(&name)
                .map(|q| q.consumers.iter().map(|c| c.id).collect())
                .unwrap_or_default();
            for consumer in consumers {
                state.cancel_consumer(&self.state, &name, consumer);
            }
        }
        warn!("Severed all broker connections");
    }

    pub fn has_exchange(&self, name: &str) -> bool {
        lock(&self.state).exchanges.contains_key(name)
    }

    pub fn has_queue(&self, name: &str) -> bool {
        lock(&self.state).queues.contains_key(name)
    }

    /// Messages waiting for delivery.
    pub fn ready_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages delivered but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        lock(&self.state)
            .queues
            .get(queue)
            .map_or(0, |q| q.unacked.len())
    }

    /// Bodies of the messages waiting in `queue`, front first.
    pub fn queued_bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        lock(&self.state)
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    fn ensure_reachable(state: &State) -> Result<()> {
        if state.unreachable {
            return Err(BusError::Connection("broker unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TopologyManager for MemoryBroker {
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let mut state = lock(&self.state);
        Self::ensure_reachable(&state)?;
        state.declare_exchange(spec)?;
        debug!(exchange = %spec.name, kind = %spec.kind, "Declared exchange");
        Ok(())
    }

    async fn declare_and_bind_queue(&self, binding: &QueueBinding) -> Result<String> {
        let mut state = lock(&self.state);
        Self::ensure_reachable(&state)?;
        let queue = state.declare_and_bind(binding)?;
        debug!(
            exchange = %binding.exchange,
            queue = %queue,
            routing_key = %binding.routing_key,
            "Bound queue to exchange"
        );
        Ok(queue)
    }
}

#[async_trait]
impl Publisher for MemoryBroker {
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutgoingMessage,
    ) -> Result<()> {
        let mut state = lock(&self.state);
        if state.unreachable {
            return Err(BusError::Publish("broker unreachable".to_string()));
        }

        let targets = if exchange.is_empty() {
            // Default exchange routes straight to the queue named by the key.
            if state.queues.contains_key(routing_key) {
                vec![routing_key.to_string()]
            } else {
                Vec::new()
            }
        } else {
            state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BusError::Publish(format!("no exchange '{}'", exchange)))?
                .routes(routing_key)
        };

        let stored = StoredMessage {
            routing_key: routing_key.to_string(),
            body: message.body,
            content_type: message.content_type,
            redelivered: false,
        };
        for queue in &targets {
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(stored.clone());
            }
            state.dispatch(&self.state, queue);
        }

        debug!(exchange, routing_key, queues = targets.len(), "Published message");
        Ok(())
    }
}

#[async_trait]
impl MessageSource for MemoryBroker {
    async fn consume(
        &self,
        binding: &QueueBinding,
        prefetch: u16,
    ) -> Result<(String, DeliveryStream)> {
        let mut state = lock(&self.state);
        Self::ensure_reachable(&state)?;
        let queue_name = state.declare_and_bind(binding)?;

        state.next_consumer += 1;
        let consumer = state.next_consumer;
        let (tx, rx) = mpsc::unbounded();
        if let Some(queue) = state.queues.get_mut(&queue_name) {
            queue.consumers.push(ConsumerSlot {
                id: consumer,
                prefetch: usize::from(prefetch.max(1)),
                in_flight: 0,
                tx,
            });
        }
        state.dispatch(&self.state, &queue_name);

        info!(queue = %queue_name, prefetch, "Consumer attached");
        let stream = ConsumerStream {
            rx,
            state: Arc::clone(&self.state),
            queue: queue_name.clone(),
            consumer,
        };
        Ok((queue_name, stream.boxed()))
    }
}

/// Delivery stream for one consumer. Dropping it cancels the consumer.
struct ConsumerStream {
    rx: mpsc::UnboundedReceiver<Result<InboundMessage>>,
    state: Arc<Mutex<State>>,
    queue: String,
    consumer: u64,
}

impl Stream for ConsumerStream {
    type Item = Result<InboundMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_next_unpin(cx)
    }
}

impl Drop for ConsumerStream {
    fn drop(&mut self) {
        let mut state = lock(&self.state);
        state.cancel_consumer(&self.state, &self.queue, self.consumer);
    }
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    queue: String,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: Option<bool>) -> Result<()> {
        let shared = self
            .state
            .upgrade()
            .ok_or_else(|| BusError::Ack("broker is gone".to_string()))?;
        let mut state = lock(&shared);

        let queue = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BusError::Ack(format!("queue '{}' no longer exists", self.queue)))?;
        let entry = queue
            .unacked
            .remove(&self.tag)
            .ok_or_else(|| BusError::Ack(format!("unknown delivery tag {}", self.tag)))?;

        if let Some(consumer) = queue.consumers.iter_mut().find(|c| c.id == entry.consumer) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }
        if requeue == Some(true) {
            let mut message = entry.message;
            message.redelivered = true;
            queue.ready.push_front(message);
        }

        state.dispatch(&shared, &self.queue);
        Ok(())
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(None)
    }

    async fn nack(&self, requeue: bool) -> Result<()> {
        self.settle(Some(requeue))
    }
}

#[cfg(test)]
mod tests;
