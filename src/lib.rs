//! Outpost - transactional outbox relay and typed AMQP pub/sub
//!
//! Domain services write an outbox row in the same PostgreSQL transaction
//! as their state change. The relay publishes those rows to a RabbitMQ topic
//! exchange, and subscribers consume them with explicit ack / nack-requeue /
//! nack-discard decisions.

pub mod bus;
pub mod config;
pub mod relay;
pub mod storage;
pub mod utils;
