//! # Idempotent RabbitMQ Worker
//! A RabbitMQ consumer that processes each logical message at most once, using
//! Redis claims for cross-consumer deduplication, header-tracked retries and a
//! dead-letter queue (DLQ) for messages that keep failing.

pub mod amqp;
pub mod broker;
pub mod dlq;
pub mod error;
pub mod handler;
pub mod idempotency;
pub mod memory;
pub mod redis_store;
pub mod retry;
pub mod status;
pub mod worker;

// Re-export key components for easy access
pub use amqp::LapinBroker;
pub use broker::{BrokerAdapter, Delivery, HeaderValue, Headers, OutboundMessage, QueueInspector};
pub use dlq::{DeadLetterRouter, RetryAction};
pub use error::{ConsumerError, ProcessingError};
pub use handler::{FailureInjection, ProcessingCallback};
pub use idempotency::{ClaimOutcome, ClaimToken, IdempotencyStore};
pub use memory::{InMemoryBroker, InMemoryIdempotencyStore};
pub use redis_store::RedisIdempotencyStore;
pub use retry::{RetryConfig, RetryMetadata};
pub use status::{queue_status, QueueStatus};
pub use worker::{DeliveryOutcome, IdempotentConsumer, RabbitRedisConsumer, WorkerConfig};
