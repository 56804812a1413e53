//! The broker boundary: deliveries, outbound messages and the adapter traits.

use crate::error::ConsumerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Message metadata, keyed by header name.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A broker-neutral header value.
///
/// AMQP integer widths all collapse into [`HeaderValue::Int`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HeaderValue {
    Int(i64),
    Float(f64),
    Bool(bool),
    Text(String),
    Bytes(Vec<u8>),
    List(Vec<HeaderValue>),
    Table(Headers),
    Void,
}

impl HeaderValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            HeaderValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::Text(v.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::Text(v)
    }
}

/// One hand-off of a message from the broker to this consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Caller-supplied identity of the logical message.
    pub id: String,
    /// Broker-assigned ordinal, only meaningful for acknowledgement.
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub content_type: Option<String>,
}

impl Delivery {
    /// Builds a copy of this message for republishing with new headers.
    ///
    /// The payload and content type are carried over unchanged.
    pub fn republish_with(&self, headers: Headers) -> OutboundMessage {
        OutboundMessage {
            message_id: self.id.clone(),
            payload: self.payload.clone(),
            headers,
            content_type: self.content_type.clone(),
        }
    }
}

/// A message the consumer asks the broker to publish.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub message_id: String,
    pub payload: Vec<u8>,
    pub headers: Headers,
    pub content_type: Option<String>,
}

/// Receive, acknowledge and publish capability of a message broker.
///
/// Acknowledgement is the only way a delivery is resolved; redelivery is always
/// an explicit [`publish`](BrokerAdapter::publish) followed by an ack of the original.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    /// Waits for the next delivery. `Ok(None)` means the consumer stream has ended.
    async fn receive(&self) -> Result<Option<Delivery>, ConsumerError>;

    /// Acknowledges the delivery identified by `delivery_tag`.
    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumerError>;

    /// Publishes `message` to the queue named `destination`.
    async fn publish(&self, destination: &str, message: OutboundMessage) -> Result<(), ConsumerError>;
}

/// Read-only queue depth inspection, used for status reporting.
#[async_trait]
pub trait QueueInspector: Send + Sync {
    async fn message_count(&self, queue: &str) -> Result<u32, ConsumerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_republish_keeps_payload_and_identity() {
        let delivery = Delivery {
            id: "m1".to_string(),
            delivery_tag: 7,
            payload: vec![0, 159, 146, 150],
            headers: Headers::new(),
            content_type: Some("application/json".to_string()),
        };

        let mut headers = Headers::new();
        headers.insert("x-retries".to_string(), HeaderValue::Int(1));
        let out = delivery.republish_with(headers.clone());

        assert_eq!(out.message_id, "m1");
        assert_eq!(out.payload, delivery.payload);
        assert_eq!(out.content_type.as_deref(), Some("application/json"));
        assert_eq!(out.headers, headers);
    }

    #[test]
    fn test_header_value_accessors() {
        assert_eq!(HeaderValue::from(3_i64).as_int(), Some(3));
        assert_eq!(HeaderValue::from("x").as_text(), Some("x"));
        assert_eq!(HeaderValue::Bool(true).as_int(), None);
    }
}
