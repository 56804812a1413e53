//! Redis-backed idempotency store.

use crate::error::ConsumerError;
use crate::idempotency::{
    record_key, ClaimOutcome, ClaimToken, IdempotencyStore, DEFAULT_CLAIM_TTL, DEFAULT_KEY_PREFIX,
    PROCESSED_MARKER,
};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{cmd, Script};
use std::time::Duration;

// Compare-and-delete, evaluated server side so a stale claimant can never
// remove a claim taken after its own one expired.
const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
";

/// Idempotency records stored as plain string keys in Redis.
///
/// A claim is `SET key token NX PX ttl`; the processed marker is a plain `SET`,
/// which also clears the claim's expiry.
#[derive(Clone)]
pub struct RedisIdempotencyStore {
    conn: ConnectionManager,
    key_prefix: String,
    claim_ttl: Duration,
    release_script: Script,
}

impl RedisIdempotencyStore {
    /// Connects to Redis with automatic reconnection.
    pub async fn connect(url: &str) -> Result<Self, ConsumerError> {
        let client = redis::Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        log::info!("Connected to Redis idempotency store.");
        Ok(Self::new(conn))
    }

    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            claim_ttl: DEFAULT_CLAIM_TTL,
            release_script: Script::new(RELEASE_SCRIPT),
        }
    }

    pub fn with_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    pub fn with_claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = ttl;
        self
    }

    fn key(&self, id: &str) -> String {
        record_key(&self.key_prefix, id)
    }
}

#[async_trait]
impl IdempotencyStore for RedisIdempotencyStore {
    async fn claim(&self, id: &str) -> Result<ClaimOutcome, ConsumerError> {
        let token = ClaimToken::generate();
        let ttl_ms = u64::try_from(self.claim_ttl.as_millis()).unwrap_or(u64::MAX).max(1);
        let mut conn = self.conn.clone();

        // SET NX replies OK on success and nil when the key already exists.
        let reply: Option<String> = cmd("SET")
            .arg(self.key(id))
            .arg(token.as_str())
            .arg("NX")
            .arg("PX")
            .arg(ttl_ms)
            .query_async(&mut conn)
            .await?;

        Ok(match reply {
            Some(_) => ClaimOutcome::Claimed(token),
            None => ClaimOutcome::Duplicate,
        })
    }

    async fn is_processed(&self, id: &str) -> Result<bool, ConsumerError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = cmd("GET").arg(self.key(id)).query_async(&mut conn).await?;
        Ok(value.as_deref() == Some(PROCESSED_MARKER))
    }

    async fn mark_processed(&self, id: &str) -> Result<(), ConsumerError> {
        let mut conn = self.conn.clone();
        let _: () = cmd("SET")
            .arg(self.key(id))
            .arg(PROCESSED_MARKER)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn release(&self, id: &str, token: &ClaimToken) -> Result<bool, ConsumerError> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release_script
            .key(self.key(id))
            .arg(token.as_str())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }
}
