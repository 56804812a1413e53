//! Retry republishing and Dead Letter Queue (DLQ) routing.

use crate::broker::{BrokerAdapter, Delivery, HeaderValue, OutboundMessage};
use crate::error::{ConsumerError, ProcessingError};
use crate::retry::{
    read_attempts, with_failure_annotation, with_incremented_attempts, RetryConfig,
    DEAD_LETTERED_AT_HEADER,
};
use chrono::Utc;

/// Represents the outcome of routing a failed delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryAction {
    /// The message was republished to the primary queue.
    ScheduledRetry { attempts: u32 },
    /// The message was sent to the DLQ, either out of retries or after a fatal failure.
    SentToDlq { attempts: u32, reason: String },
}

/// Decides whether a failed delivery is retried or dead-lettered, and publishes
/// the corresponding copy. The payload is never touched; only headers change.
#[derive(Debug, Clone)]
pub struct DeadLetterRouter {
    primary_queue: String,
    dead_letter_queue: String,
    retry_config: RetryConfig,
}

impl DeadLetterRouter {
    pub fn new(
        primary_queue: impl Into<String>,
        dead_letter_queue: impl Into<String>,
        retry_config: RetryConfig,
    ) -> Self {
        Self {
            primary_queue: primary_queue.into(),
            dead_letter_queue: dead_letter_queue.into(),
            retry_config,
        }
    }

    /// Builds the copy to publish for `delivery` after `error`, and its destination.
    pub fn plan(&self, delivery: &Delivery, error: &ProcessingError) -> (RetryAction, String, OutboundMessage) {
        let attempts = read_attempts(&delivery.headers).saturating_add(1);
        let headers = with_incremented_attempts(&delivery.headers);

        if let ProcessingError::Retryable(_) = error {
            if self.retry_config.should_retry(attempts) {
                return (
                    RetryAction::ScheduledRetry { attempts },
                    self.primary_queue.clone(),
                    delivery.republish_with(headers),
                );
            }
        }

        let reason = error.reason().to_string();
        let mut headers = with_failure_annotation(&headers, &reason, &self.primary_queue);
        headers.insert(
            DEAD_LETTERED_AT_HEADER.to_string(),
            HeaderValue::Text(Utc::now().to_rfc3339()),
        );
        (
            RetryAction::SentToDlq { attempts, reason },
            self.dead_letter_queue.clone(),
            delivery.republish_with(headers),
        )
    }

    /// Publishes the retry or dead-letter copy of a failed delivery.
    ///
    /// The caller must already have released its claim and still owes the ack.
    pub async fn route_failure<B: BrokerAdapter + ?Sized>(
        &self,
        broker: &B,
        delivery: &Delivery,
        error: &ProcessingError,
    ) -> Result<RetryAction, ConsumerError> {
        let (action, destination, message) = self.plan(delivery, error);
        broker.publish(&destination, message).await?;

        match &action {
            RetryAction::ScheduledRetry { attempts } => log::warn!(
                "Message {} republished to '{}' for retry (attempt {}).",
                delivery.id,
                destination,
                attempts
            ),
            RetryAction::SentToDlq { attempts, reason } => log::error!(
                "Message {} moved to DLQ '{}' after {} attempts: {}",
                delivery.id,
                destination,
                attempts,
                reason
            ),
        }
        Ok(action)
    }

    pub fn primary_queue(&self) -> &str {
        &self.primary_queue
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter_queue
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Headers;
    use crate::retry::{RetryMetadata, RETRIES_HEADER};

    fn delivery(attempts: Option<i64>) -> Delivery {
        let mut headers = Headers::new();
        headers.insert("trace-id".to_string(), HeaderValue::from("t-1"));
        if let Some(n) = attempts {
            headers.insert(RETRIES_HEADER.to_string(), HeaderValue::Int(n));
        }
        Delivery {
            id: "m2".to_string(),
            delivery_tag: 9,
            payload: b"{\"messageId\":\"m2\"}".to_vec(),
            headers,
            content_type: Some("application/json".to_string()),
        }
    }

    fn router() -> DeadLetterRouter {
        DeadLetterRouter::new("command.queue", "command.dlq", RetryConfig::default())
    }

    #[test]
    fn test_retryable_failure_within_budget_goes_back_to_primary() {
        let d = delivery(Some(2));
        let (action, destination, message) = router().plan(&d, &ProcessingError::Retryable("boom".into()));

        assert_eq!(action, RetryAction::ScheduledRetry { attempts: 3 });
        assert_eq!(destination, "command.queue");
        assert_eq!(message.payload, d.payload);
        let meta = RetryMetadata::from_headers(&message.headers);
        assert_eq!(meta.attempts, 3);
        assert_eq!(meta.error_reason, None);
        assert_eq!(message.headers.get("trace-id"), Some(&HeaderValue::from("t-1")));
    }

    #[test]
    fn test_retryable_failure_over_budget_is_dead_lettered() {
        let d = delivery(Some(3));
        let (action, destination, message) = router().plan(&d, &ProcessingError::Retryable("boom".into()));

        assert_eq!(
            action,
            RetryAction::SentToDlq {
                attempts: 4,
                reason: "boom".to_string()
            }
        );
        assert_eq!(destination, "command.dlq");
        assert_eq!(message.payload, d.payload);
        assert_eq!(message.content_type, d.content_type);

        let meta = RetryMetadata::from_headers(&message.headers);
        assert_eq!(meta.attempts, 4);
        assert_eq!(meta.error_reason.as_deref(), Some("boom"));
        assert_eq!(meta.original_queue.as_deref(), Some("command.queue"));
        assert!(message.headers.contains_key(DEAD_LETTERED_AT_HEADER));
    }

    #[test]
    fn test_fatal_failure_bypasses_budget() {
        let (action, destination, message) = router().plan(&delivery(None), &ProcessingError::Fatal("corrupt".into()));

        assert_eq!(
            action,
            RetryAction::SentToDlq {
                attempts: 1,
                reason: "corrupt".to_string()
            }
        );
        assert_eq!(destination, "command.dlq");
        assert_eq!(RetryMetadata::from_headers(&message.headers).attempts, 1);
    }
}
