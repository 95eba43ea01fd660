use super::*;
use std::time::Duration;

async fn broker_with_exchange(name: &str) -> MemoryBroker {
    let broker = MemoryBroker::new();
    broker
        .declare_exchange(&ExchangeSpec::topic(name))
        .await
        .unwrap();
    broker
}

async fn publish(broker: &MemoryBroker, routing_key: &str, body: &str) {
    broker
        .publish("events", routing_key, OutgoingMessage::json(body.as_bytes().to_vec()))
        .await
        .unwrap();
}

async fn next(stream: &mut DeliveryStream) -> InboundMessage {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("Timed out waiting for delivery")
        .expect("Stream ended")
        .expect("Delivery error")
}

async fn assert_idle(stream: &mut DeliveryStream) {
    let pending = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
    assert!(pending.is_err(), "expected no delivery");
}

#[tokio::test]
async fn test_exchange_redeclare_is_idempotent() {
    let broker = broker_with_exchange("events").await;
    broker
        .declare_exchange(&ExchangeSpec::topic("events"))
        .await
        .unwrap();
    assert!(broker.has_exchange("events"));
}

#[tokio::test]
async fn test_exchange_redeclare_with_different_kind_conflicts() {
    let broker = broker_with_exchange("events").await;
    let spec = ExchangeSpec {
        name: "events".to_string(),
        kind: ExchangeKind::Fanout,
        durability: Durability::Durable,
    };
    let err = broker.declare_exchange(&spec).await.unwrap_err();
    assert!(matches!(err, BusError::Topology(_)));
}

#[tokio::test]
async fn test_queue_redeclare_with_different_durability_conflicts() {
    let broker = broker_with_exchange("events").await;
    broker
        .declare_and_bind_queue(&QueueBinding::durable("events", "progress", "anime.*"))
        .await
        .unwrap();

    let mut transient = QueueBinding::durable("events", "progress", "anime.*");
    transient.durability = Durability::Transient;
    let err = broker.declare_and_bind_queue(&transient).await.unwrap_err();
    assert!(matches!(err, BusError::Topology(_)));
}

#[tokio::test]
async fn test_bind_to_missing_exchange_fails() {
    let broker = MemoryBroker::new();
    let err = broker
        .declare_and_bind_queue(&QueueBinding::durable("missing", "q", "#"))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Topology(_)));
}

#[tokio::test]
async fn test_empty_queue_name_is_broker_assigned() {
    let broker = broker_with_exchange("events").await;
    let first = broker
        .declare_and_bind_queue(&QueueBinding::exclusive("events", "#"))
        .await
        .unwrap();
    let second = broker
        .declare_and_bind_queue(&QueueBinding::exclusive("events", "#"))
        .await
        .unwrap();

    assert!(first.starts_with("amq.gen-"));
    assert_ne!(first, second);
}

#[tokio::test]
async fn test_topic_routing() {
    let broker = broker_with_exchange("events").await;
    broker
        .declare_and_bind_queue(&QueueBinding::durable("events", "anime", "anime.*"))
        .await
        .unwrap();
    broker
        .declare_and_bind_queue(&QueueBinding::durable("events", "progress", "progress.*"))
        .await
        .unwrap();
    broker
        .declare_and_bind_queue(&QueueBinding::durable("events", "audit", "#"))
        .await
        .unwrap();

    publish(&broker, "anime.create", "{}").await;

    assert_eq!(broker.ready_count("anime"), 1);
    assert_eq!(broker.ready_count("progress"), 0);
    assert_eq!(broker.ready_count("audit"), 1);
}

#[tokio::test]
async fn test_direct_and_fanout_routing() {
    let broker = MemoryBroker::new();
    broker
        .declare_exchange(&ExchangeSpec {
            name: "direct".to_string(),
            kind: ExchangeKind::Direct,
            durability: Durability::Durable,
        })
        .await
        .unwrap();
    broker
        .declare_exchange(&ExchangeSpec {
            name: "fanout".to_string(),
            kind: ExchangeKind::Fanout,
            durability: Durability::Durable,
        })
        .await
        .unwrap();
    broker
        .declare_and_bind_queue(&QueueBinding::durable("direct", "d", "anime.*"))
        .await
        .unwrap();
    broker
        .declare_and_bind_queue(&QueueBinding::durable("fanout", "f", "ignored"))
        .await
        .unwrap();

    for exchange in ["direct", "fanout"] {
        broker
            .publish(exchange, "anime.create", OutgoingMessage::json(b"{}".to_vec()))
            .await
            .unwrap();
    }

    // Direct exchanges compare keys literally; wildcards mean nothing.
    assert_eq!(broker.ready_count("d"), 0);
    assert_eq!(broker.ready_count("f"), 1);
}

#[tokio::test]
async fn test_unroutable_message_is_dropped() {
    let broker = broker_with_exchange("events").await;
    publish(&broker, "anime.create", "{}").await;
    assert!(!broker.has_queue("anime"));
}

#[tokio::test]
async fn test_prefetch_limits_in_flight_deliveries() {
    let broker = broker_with_exchange("events").await;
    let binding = QueueBinding::durable("events", "work", "#");
    let (queue, mut stream) = broker.consume(&binding, 2).await.unwrap();

    for i in 0..5 {
        publish(&broker, "anime.create", &format!("{{\"n\":{}}}", i)).await;
    }

    let first = next(&mut stream).await;
    let _second = next(&mut stream).await;
    assert_idle(&mut stream).await;
    assert_eq!(broker.unacked_count(&queue), 2);
    assert_eq!(broker.ready_count(&queue), 3);

    first.ack().await.unwrap();
    let third = next(&mut stream).await;
    assert_eq!(third.body, b"{\"n\":2}".to_vec());
    assert_idle(&mut stream).await;
}

#[tokio::test]
async fn test_nack_requeue_redelivers_with_flag() {
    let broker = broker_with_exchange("events").await;
    let binding = QueueBinding::durable("events", "work", "#");
    let (_, mut stream) = broker.consume(&binding, 1).await.unwrap();
    publish(&broker, "anime.create", "{\"n\":1}").await;

    let first = next(&mut stream).await;
    assert!(!first.redelivered);
    first.nack(true).await.unwrap();

    let again = next(&mut stream).await;
    assert!(again.redelivered);
    assert_eq!(again.body, first.body);
}

#[tokio::test]
async fn test_nack_discard_drops_message() {
    let broker = broker_with_exchange("events").await;
    let binding = QueueBinding::durable("events", "work", "#");
    let (queue, mut stream) = broker.consume(&binding, 1).await.unwrap();
    publish(&broker, "anime.create", "{}").await;

    let message = next(&mut stream).await;
    message.nack(false).await.unwrap();

    assert_idle(&mut stream).await;
    assert_eq!(broker.ready_count(&queue), 0);
    assert_eq!(broker.unacked_count(&queue), 0);
}

#[tokio::test]
async fn test_double_ack_fails() {
    let broker = broker_with_exchange("events").await;
    let binding = QueueBinding::durable("events", "work", "#");
    let (_, mut stream) = broker.consume(&binding, 1).await.unwrap();
    publish(&broker, "anime.create", "{}").await;

    let message = next(&mut stream).await;
    message.ack().await.unwrap();
    let err = message.ack().await.unwrap_err();
    assert!(matches!(err, BusError::Ack(_)));
}

#[tokio::test]
async fn test_dropped_consumer_requeues_unacked() {
    let broker = broker_with_exchange("events").await;
    let binding = QueueBinding::durable("events", "work", "#");
    let (queue, mut stream) = broker.consume(&binding, 1).await.unwrap();
    publish(&broker, "anime.create", "{}").await;

    let _unacked = next(&mut stream).await;
    drop(stream);

    assert_eq!(broker.ready_count(&queue), 1);
    assert_eq!(broker.unacked_count(&queue), 0);

    let (_, mut stream) = broker.consume(&binding, 1).await.unwrap();
    assert!(next(&mut stream).await.redelivered);
}

#[tokio::test]
async fn test_transient_queue_deleted_after_last_consumer() {
    let broker = broker_with_exchange("events").await;
    let (queue, stream) = broker
        .consume(&QueueBinding::exclusive("events", "#"), 1)
        .await
        .unwrap();
    assert!(broker.has_queue(&queue));

    drop(stream);
    assert!(!broker.has_queue(&queue));
}

#[tokio::test]
async fn test_durable_queue_survives_consumer() {
    let broker = broker_with_exchange("events").await;
    let (queue, stream) = broker
        .consume(&QueueBinding::durable("events", "work", "#"), 1)
        .await
        .unwrap();

    drop(stream);
    assert!(broker.has_queue(&queue));
}

#[tokio::test]
async fn test_unreachable_broker_rejects_operations() {
    let broker = broker_with_exchange("events").await;
    broker.set_unreachable(true);

    let err = broker
        .publish("events", "anime.create", OutgoingMessage::json(b"{}".to_vec()))
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Publish(_)));

    let err = broker
        .consume(&QueueBinding::durable("events", "work", "#"), 1)
        .await
        .err()
        .unwrap();
    assert!(matches!(err, BusError::Connection(_)));

    broker.set_unreachable(false);
    publish(&broker, "anime.create", "{}").await;
}

#[tokio::test]
async fn test_severed_connection_ends_stream() {
    let broker = broker_with_exchange("events").await;
    let (queue, mut stream) = broker
        .consume(&QueueBinding::durable("events", "work", "#"), 1)
        .await
        .unwrap();
    publish(&broker, "anime.create", "{}").await;
    let _in_flight = next(&mut stream).await;

    broker.sever_connections();

    assert_eq!(broker.ready_count(&queue), 1);
    assert!(stream.next().await.is_none());
}
