//! In-process store and broker bindings.
//!
//! These keep the same contracts as the Redis and RabbitMQ bindings and are
//! meant for tests, demos and single-process setups.

use crate::broker::{BrokerAdapter, Delivery, OutboundMessage, QueueInspector};
use crate::error::ConsumerError;
use crate::idempotency::{ClaimOutcome, ClaimToken, IdempotencyStore, DEFAULT_CLAIM_TTL};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Record {
    Claimed { token: ClaimToken, expires_at: Instant },
    Processed,
}

/// Idempotency store held in memory. Claim expiry follows the tokio clock.
pub struct InMemoryIdempotencyStore {
    records: Mutex<HashMap<String, Record>>,
    claim_ttl: Duration,
    available: AtomicBool,
}

impl InMemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::with_claim_ttl(DEFAULT_CLAIM_TTL)
    }

    pub fn with_claim_ttl(claim_ttl: Duration) -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            claim_ttl,
            available: AtomicBool::new(true),
        }
    }

    /// Simulates the store going away (`false`) or coming back (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// True if a live, unexpired claim is held on `id`.
    pub async fn is_claimed(&self, id: &str) -> bool {
        let mut records = self.records.lock().await;
        Self::evict_expired(&mut records, id);
        matches!(records.get(id), Some(Record::Claimed { .. }))
    }

    fn check_available(&self) -> Result<(), ConsumerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConsumerError::StoreUnavailable("in-memory store switched off".to_string()))
        }
    }

    fn evict_expired(records: &mut HashMap<String, Record>, id: &str) {
        let expired = matches!(
            records.get(id),
            Some(Record::Claimed { expires_at, .. }) if *expires_at <= Instant::now()
        );
        if expired {
            records.remove(id);
        }
    }
}

impl Default for InMemoryIdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl IdempotencyStore for InMemoryIdempotencyStore {
    async fn claim(&self, id: &str) -> Result<ClaimOutcome, ConsumerError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        Self::evict_expired(&mut records, id);
        if records.contains_key(id) {
            return Ok(ClaimOutcome::Duplicate);
        }

        let token = ClaimToken::generate();
        records.insert(
            id.to_string(),
            Record::Claimed {
                token: token.clone(),
                expires_at: Instant::now() + self.claim_ttl,
            },
        );
        Ok(ClaimOutcome::Claimed(token))
    }

    async fn is_processed(&self, id: &str) -> Result<bool, ConsumerError> {
        self.check_available()?;
        let records = self.records.lock().await;
        Ok(matches!(records.get(id), Some(Record::Processed)))
    }

    async fn mark_processed(&self, id: &str) -> Result<(), ConsumerError> {
        self.check_available()?;
        self.records.lock().await.insert(id.to_string(), Record::Processed);
        Ok(())
    }

    async fn release(&self, id: &str, token: &ClaimToken) -> Result<bool, ConsumerError> {
        self.check_available()?;
        let mut records = self.records.lock().await;
        Self::evict_expired(&mut records, id);
        match records.get(id) {
            Some(Record::Claimed { token: held, .. }) if held == token => {
                records.remove(id);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Broker made of named FIFO queues.
///
/// Publishing to a queue creates a fresh delivery on it. `receive` drains the
/// consumed queue and reports the end of the stream once it is empty.
pub struct InMemoryBroker {
    consume_queue: String,
    queues: Mutex<HashMap<String, VecDeque<Delivery>>>,
    acked: Mutex<Vec<u64>>,
    published: Mutex<Vec<(String, OutboundMessage)>>,
    next_tag: AtomicU64,
    available: AtomicBool,
}

impl InMemoryBroker {
    pub fn new(consume_queue: impl Into<String>) -> Self {
        Self {
            consume_queue: consume_queue.into(),
            queues: Mutex::new(HashMap::new()),
            acked: Mutex::new(Vec::new()),
            published: Mutex::new(Vec::new()),
            next_tag: AtomicU64::new(1),
            available: AtomicBool::new(true),
        }
    }

    /// Places a message on `queue` without recording it as published. Returns its delivery tag.
    pub async fn enqueue(&self, queue: &str, message: OutboundMessage) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::SeqCst);
        let delivery = Delivery {
            id: message.message_id,
            delivery_tag: tag,
            payload: message.payload,
            headers: message.headers,
            content_type: message.content_type,
        };
        self.queues
            .lock()
            .await
            .entry(queue.to_string())
            .or_default()
            .push_back(delivery);
        tag
    }

    /// Simulates the broker connection dropping (`false`) or recovering (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn acked(&self) -> Vec<u64> {
        self.acked.lock().await.clone()
    }

    /// Every publish so far, in order, with its destination.
    pub async fn published(&self) -> Vec<(String, OutboundMessage)> {
        self.published.lock().await.clone()
    }

    pub async fn published_to(&self, queue: &str) -> Vec<OutboundMessage> {
        self.published
            .lock()
            .await
            .iter()
            .filter(|(destination, _)| destination == queue)
            .map(|(_, message)| message.clone())
            .collect()
    }

    fn check_available(&self) -> Result<(), ConsumerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConsumerError::BrokerUnavailable("in-memory broker switched off".to_string()))
        }
    }
}

#[async_trait]
impl BrokerAdapter for InMemoryBroker {
    async fn receive(&self) -> Result<Option<Delivery>, ConsumerError> {
        self.check_available()?;
        let mut queues = self.queues.lock().await;
        Ok(queues
            .get_mut(&self.consume_queue)
            .and_then(VecDeque::pop_front))
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumerError> {
        self.check_available()?;
        self.acked.lock().await.push(delivery_tag);
        Ok(())
    }

    async fn publish(&self, destination: &str, message: OutboundMessage) -> Result<(), ConsumerError> {
        self.check_available()?;
        self.published
            .lock()
            .await
            .push((destination.to_string(), message.clone()));
        self.enqueue(destination, message).await;
        Ok(())
    }
}

#[async_trait]
impl QueueInspector for InMemoryBroker {
    async fn message_count(&self, queue: &str) -> Result<u32, ConsumerError> {
        self.check_available()?;
        let queues = self.queues.lock().await;
        let depth = queues.get(queue).map_or(0, VecDeque::len);
        Ok(u32::try_from(depth).unwrap_or(u32::MAX))
    }
}
