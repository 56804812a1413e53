//! Defines the core trait for message processing logic.

use crate::broker::Delivery;
use crate::error::ProcessingError;
use async_trait::async_trait;
use std::sync::Arc;

/// Business logic invoked for each claimed delivery.
///
/// Implement this trait for your own processing. The consumer does not resolve
/// the delivery until `process` returns, and never cancels it.
#[async_trait]
pub trait ProcessingCallback: Send + Sync {
    /// Processes a single delivery.
    ///
    /// # Returns
    /// `Ok(())` on success, [`ProcessingError::Retryable`] for a transient failure
    /// or [`ProcessingError::Fatal`] to dead-letter the message immediately.
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError>;

    /// A name for the callback, used for logging and identification.
    fn handler_name(&self) -> &str;
}

#[async_trait]
impl<T: ProcessingCallback + ?Sized> ProcessingCallback for Arc<T> {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        (**self).process(delivery).await
    }

    fn handler_name(&self) -> &str {
        (**self).handler_name()
    }
}

/// Decides, per message id, whether a simulated failure should be injected.
pub type FailureDecision = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Wraps a callback and fails selected deliveries with a retryable error
/// before they reach it.
///
/// The decision function is the only source of non-determinism, so tests pass
/// a fixed one and demos a random one.
pub struct FailureInjection<P> {
    inner: P,
    decide: FailureDecision,
}

impl<P: ProcessingCallback> FailureInjection<P> {
    pub fn new(inner: P, decide: impl Fn(&str) -> bool + Send + Sync + 'static) -> Self {
        Self {
            inner,
            decide: Arc::new(decide),
        }
    }
}

#[async_trait]
impl<P: ProcessingCallback> ProcessingCallback for FailureInjection<P> {
    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        if (self.decide)(&delivery.id) {
            log::warn!("Simulating a processing failure for message {}", delivery.id);
            return Err(ProcessingError::Retryable(format!(
                "Simulated processing failure for messageId={}",
                delivery.id
            )));
        }
        self.inner.process(delivery).await
    }

    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }
}
