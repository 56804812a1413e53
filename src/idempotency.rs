//! Claim-based duplicate suppression over message identity.
//!
//! A record per message id is either absent, claimed by one consumer (with a
//! token and an expiry), or processed. `processed` is terminal. The store is the
//! only point of coordination between consumers, so `claim` and `release` must
//! each be a single atomic store operation.

use crate::error::ConsumerError;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Default key namespace for idempotency records.
pub const DEFAULT_KEY_PREFIX: &str = "processed:";

/// Sentinel value stored once a message has been processed.
pub const PROCESSED_MARKER: &str = "PROCESSED";

/// How long an unresolved claim is honoured before the id becomes reclaimable.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(5 * 60);

/// Proof of ownership of a claim, required to release it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimToken(String);

impl ClaimToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of trying to claim a message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This caller now owns the claim.
    Claimed(ClaimToken),
    /// A record already exists: either a live claim or a processed marker.
    Duplicate,
}

/// Atomic claim/release/mark operations over message identity.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Creates a claim for `id` iff no record exists.
    async fn claim(&self, id: &str) -> Result<ClaimOutcome, ConsumerError>;

    /// True iff the record for `id` is in the processed state.
    async fn is_processed(&self, id: &str) -> Result<bool, ConsumerError>;

    /// Marks `id` processed, dropping any expiry. Safe to repeat.
    async fn mark_processed(&self, id: &str) -> Result<(), ConsumerError>;

    /// Deletes the claim on `id` only if it is still held with `token`.
    ///
    /// Returns whether a record was deleted.
    async fn release(&self, id: &str, token: &ClaimToken) -> Result<bool, ConsumerError>;
}

/// Builds the store key for a message id.
pub fn record_key(prefix: &str, id: &str) -> String {
    format!("{}{}", prefix, id)
}
