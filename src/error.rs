use thiserror::Error;

/// Infrastructure errors raised while handling a delivery.
///
/// Any of these aborts the current delivery *without* acknowledging it, so the
/// broker keeps it and redelivers it once the consumer reconnects.
#[derive(Debug, Error)]
pub enum ConsumerError {
    /// The idempotency store could not be reached or rejected the command.
    #[error("Idempotency store unavailable: {0}")]
    StoreUnavailable(String),

    /// The broker could not be reached or rejected the command.
    #[error("Broker unavailable: {0}")]
    BrokerUnavailable(String),

    /// Invalid or incomplete worker configuration.
    #[error("Worker configuration error: {message}")]
    Configuration {
        message: String,
    },
}

// Allow converting from a string-like type into a Configuration error
impl From<&str> for ConsumerError {
    fn from(s: &str) -> Self {
        ConsumerError::Configuration { message: s.to_string() }
    }
}

impl From<redis::RedisError> for ConsumerError {
    fn from(e: redis::RedisError) -> Self {
        ConsumerError::StoreUnavailable(e.to_string())
    }
}

impl From<lapin::Error> for ConsumerError {
    fn from(e: lapin::Error) -> Self {
        ConsumerError::BrokerUnavailable(e.to_string())
    }
}

/// Failure reported by a [`ProcessingCallback`](crate::handler::ProcessingCallback).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProcessingError {
    /// Transient failure, the message is republished until the retry budget runs out.
    #[error("{0}")]
    Retryable(String),

    /// Permanent failure, the message goes straight to the dead-letter queue.
    #[error("{0}")]
    Fatal(String),
}

impl ProcessingError {
    /// The human readable reason, recorded as `x-error-reason` on dead-lettering.
    pub fn reason(&self) -> &str {
        match self {
            ProcessingError::Retryable(reason) | ProcessingError::Fatal(reason) => reason,
        }
    }
}

// Allow callbacks to bail out with a plain string, treated as retryable.
impl From<&str> for ProcessingError {
    fn from(s: &str) -> Self {
        ProcessingError::Retryable(s.to_string())
    }
}

impl From<String> for ProcessingError {
    fn from(s: String) -> Self {
        ProcessingError::Retryable(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_error_maps_to_store_unavailable() {
        let err: ConsumerError =
            redis::RedisError::from((redis::ErrorKind::IoError, "connection refused")).into();
        assert!(matches!(err, ConsumerError::StoreUnavailable(_)));
    }

    #[test]
    fn test_processing_error_reason() {
        let retry = ProcessingError::from("boom");
        assert_eq!(retry, ProcessingError::Retryable("boom".to_string()));
        assert_eq!(retry.reason(), "boom");
        assert_eq!(ProcessingError::Fatal("bad".into()).to_string(), "bad");
    }
}
