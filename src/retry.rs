//! Retry budget configuration and the retry metadata codec.
//!
//! The attempt counter and failure diagnostics travel in message headers, so a
//! republished message carries its own history and no consumer keeps state.

use crate::broker::{HeaderValue, Headers};
use serde::{Deserialize, Serialize};

/// Attempt counter header.
pub const RETRIES_HEADER: &str = "x-retries";
/// Failure reason header, set on dead-lettering.
pub const ERROR_REASON_HEADER: &str = "x-error-reason";
/// Queue the message was consumed from, set on dead-lettering.
pub const ORIGINAL_QUEUE_HEADER: &str = "x-original-queue";
/// RFC 3339 time at which the message was dead-lettered.
pub const DEAD_LETTERED_AT_HEADER: &str = "x-dead-lettered-at";

/// Default number of retryable-failure redeliveries before dead-lettering.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Configuration for message redelivery attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Checks whether a message on its `attempts`-th failure may still be retried.
    pub fn should_retry(&self, attempts: u32) -> bool {
        attempts <= self.max_retries
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_RETRIES)
    }
}

/// Decoded view of the retry-related headers of a message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryMetadata {
    pub attempts: u32,
    pub error_reason: Option<String>,
    pub original_queue: Option<String>,
}

impl RetryMetadata {
    pub fn from_headers(headers: &Headers) -> Self {
        Self {
            attempts: read_attempts(headers),
            error_reason: text_header(headers, ERROR_REASON_HEADER),
            original_queue: text_header(headers, ORIGINAL_QUEUE_HEADER),
        }
    }
}

fn text_header(headers: &Headers, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(HeaderValue::as_text)
        .map(str::to_string)
}

/// Returns the stored attempt counter, or 0 if it is absent, negative or not an integer.
///
/// Counters too large for `u32` saturate so they stay over any retry budget.
pub fn read_attempts(headers: &Headers) -> u32 {
    headers
        .get(RETRIES_HEADER)
        .and_then(HeaderValue::as_int)
        .map(|v| u32::try_from(v.max(0)).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

/// Returns a copy of `headers` with the attempt counter incremented by one.
pub fn with_incremented_attempts(headers: &Headers) -> Headers {
    let attempts = read_attempts(headers).saturating_add(1);
    let mut out = headers.clone();
    out.insert(RETRIES_HEADER.to_string(), HeaderValue::Int(i64::from(attempts)));
    out
}

/// Returns a copy of `headers` annotated with the failure reason and original queue.
pub fn with_failure_annotation(headers: &Headers, reason: &str, original_queue: &str) -> Headers {
    let mut out = headers.clone();
    out.insert(ERROR_REASON_HEADER.to_string(), HeaderValue::from(reason));
    out.insert(ORIGINAL_QUEUE_HEADER.to_string(), HeaderValue::from(original_queue));
    out
}
