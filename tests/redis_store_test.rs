//! Redis idempotency store against a live server.
//!
//! Ignored by default. Run with `REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored`.

use idempotent_rabbitmq_worker::idempotency::PROCESSED_MARKER;
use idempotent_rabbitmq_worker::{ClaimOutcome, ClaimToken, IdempotencyStore, RedisIdempotencyStore};
use redis::aio::ConnectionManager;
use redis::cmd;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

struct Fixture {
    store: RedisIdempotencyStore,
    conn: ConnectionManager,
    prefix: String,
}

impl Fixture {
    fn key(&self, id: &str) -> String {
        format!("{}{}", self.prefix, id)
    }

    async fn get(&self, id: &str) -> Option<String> {
        let mut conn = self.conn.clone();
        cmd("GET").arg(self.key(id)).query_async(&mut conn).await.unwrap()
    }

    async fn ttl_ms(&self, id: &str) -> i64 {
        let mut conn = self.conn.clone();
        cmd("PTTL").arg(self.key(id)).query_async(&mut conn).await.unwrap()
    }
}

/// Connects with a per-test key prefix, or returns `None` when `REDIS_URL` is unset.
async fn fixture() -> Option<Fixture> {
    let url = std::env::var("REDIS_URL").ok()?;
    let prefix = format!("test:{}:", Uuid::new_v4());
    let store = RedisIdempotencyStore::connect(&url)
        .await
        .unwrap()
        .with_key_prefix(prefix.clone())
        .with_claim_ttl(Duration::from_secs(30));
    let conn = ConnectionManager::new(redis::Client::open(url).unwrap()).await.unwrap();
    Some(Fixture { store, conn, prefix })
}

fn claimed(outcome: ClaimOutcome) -> ClaimToken {
    match outcome {
        ClaimOutcome::Claimed(token) => token,
        ClaimOutcome::Duplicate => panic!("expected to win the claim"),
    }
}

#[tokio::test]
#[ignore]
async fn concurrent_claims_have_one_winner() {
    let Some(f) = fixture().await else { return };
    let store = Arc::new(f.store.clone());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            tokio::spawn(async move { store.claim("m1").await.unwrap() })
        })
        .collect();

    let mut winners = 0;
    for handle in handles {
        if let ClaimOutcome::Claimed(_) = handle.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test]
#[ignore]
async fn claim_sets_token_with_expiry_and_is_not_processed() {
    let Some(f) = fixture().await else { return };
    let token = claimed(f.store.claim("m2").await.unwrap());

    assert_eq!(f.get("m2").await.as_deref(), Some(token.as_str()));
    let ttl = f.ttl_ms("m2").await;
    assert!(ttl > 0 && ttl <= 30_000, "unexpected ttl {}", ttl);
    assert!(!f.store.is_processed("m2").await.unwrap());
}

#[tokio::test]
#[ignore]
async fn release_with_wrong_token_keeps_the_claim() {
    let Some(f) = fixture().await else { return };
    let token = claimed(f.store.claim("m3").await.unwrap());

    assert!(!f.store.release("m3", &ClaimToken::generate()).await.unwrap());
    assert_eq!(f.get("m3").await.as_deref(), Some(token.as_str()));

    assert!(f.store.release("m3", &token).await.unwrap());
    assert_eq!(f.get("m3").await, None);
    claimed(f.store.claim("m3").await.unwrap());
}

#[tokio::test]
#[ignore]
async fn mark_processed_clears_expiry_and_blocks_claims() {
    let Some(f) = fixture().await else { return };
    let token = claimed(f.store.claim("m4").await.unwrap());

    f.store.mark_processed("m4").await.unwrap();
    f.store.mark_processed("m4").await.unwrap();

    assert_eq!(f.get("m4").await.as_deref(), Some(PROCESSED_MARKER));
    assert_eq!(f.ttl_ms("m4").await, -1);
    assert!(f.store.is_processed("m4").await.unwrap());
    assert_eq!(f.store.claim("m4").await.unwrap(), ClaimOutcome::Duplicate);
    // a stale claimant cannot remove the processed marker
    assert!(!f.store.release("m4", &token).await.unwrap());
    assert!(f.store.is_processed("m4").await.unwrap());

    let mut conn = f.conn.clone();
    let _: i64 = cmd("DEL").arg(f.key("m4")).query_async(&mut conn).await.unwrap();
}
