//! RabbitMQ binding of the broker boundary, built on `lapin`.

use crate::broker::{BrokerAdapter, Delivery, HeaderValue, Headers, OutboundMessage, QueueInspector};
use crate::error::ConsumerError;
use crate::retry::{with_failure_annotation, DEAD_LETTERED_AT_HEADER};
use crate::worker::WorkerConfig;
use async_trait::async_trait;
use chrono::Utc;
use futures_util::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, ByteArray, FieldArray, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, Consumer,
};
use serde::Deserialize;
use tokio::sync::Mutex;

const PERSISTENT: u8 = 2;

/// Body shape used to recover the message id when the AMQP property is missing.
#[derive(Deserialize)]
struct IdEnvelope {
    #[serde(rename = "messageId")]
    message_id: String,
}

/// A single-channel RabbitMQ consumer and publisher.
///
/// Publisher confirms are enabled, so a republished copy is confirmed by the
/// broker before the original delivery is acknowledged.
pub struct LapinBroker {
    connection: Connection,
    channel: Channel,
    consumer: Mutex<Consumer>,
    primary_queue: String,
    dead_letter_queue: String,
}

impl LapinBroker {
    /// Connects to RabbitMQ, optionally declares the queues, and starts consuming.
    pub async fn connect(config: &WorkerConfig) -> Result<Self, ConsumerError> {
        log::info!(
            "Connecting to RabbitMQ and setting up consumer for queue '{}'...",
            config.primary_queue
        );

        let connection = Connection::connect(&config.amqp_url, ConnectionProperties::default()).await?;
        let channel = connection.create_channel().await?;
        channel.confirm_select(ConfirmSelectOptions::default()).await?;

        if config.declare_queues {
            declare_queues(&channel, &config.primary_queue, &config.dead_letter_queue).await?;
        }

        channel.basic_qos(config.prefetch_count, BasicQosOptions::default()).await?;
        log::info!("QoS prefetch count set to {}", config.prefetch_count);

        let consumer = channel
            .basic_consume(
                &config.primary_queue,
                &config.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        log::info!("Consumer started with tag '{}'.", consumer.tag().as_str());

        Ok(Self {
            connection,
            channel,
            consumer: Mutex::new(consumer),
            primary_queue: config.primary_queue.clone(),
            dead_letter_queue: config.dead_letter_queue.clone(),
        })
    }

    /// Converts a lapin delivery, or returns `None` if no message id can be found.
    fn to_delivery(delivery: &lapin::message::Delivery) -> Option<Delivery> {
        let properties = &delivery.properties;
        let id = properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .filter(|id| !id.is_empty())
            .or_else(|| {
                serde_json::from_slice::<IdEnvelope>(&delivery.data)
                    .ok()
                    .map(|envelope| envelope.message_id)
            })?;

        Some(Delivery {
            id,
            delivery_tag: delivery.delivery_tag,
            payload: delivery.data.clone(),
            headers: properties.headers().as_ref().map(headers_from_table).unwrap_or_default(),
            content_type: properties.content_type().as_ref().map(|ct| ct.as_str().to_string()),
        })
    }

    /// Moves a delivery without a message id straight to the DLQ and acks it.
    async fn dead_letter_unidentified(&self, delivery: lapin::message::Delivery) -> Result<(), ConsumerError> {
        log::error!(
            "Message without an id sending to DLQ. Tag: {}",
            delivery.delivery_tag
        );

        let original = delivery.properties.headers().as_ref().map(headers_from_table).unwrap_or_default();
        let mut headers = with_failure_annotation(&original, "missing message id", &self.primary_queue);
        headers.insert(
            DEAD_LETTERED_AT_HEADER.to_string(),
            HeaderValue::Text(Utc::now().to_rfc3339()),
        );

        let mut properties = BasicProperties::default()
            .with_headers(table_from_headers(&headers))
            .with_delivery_mode(PERSISTENT);
        if let Some(content_type) = delivery.properties.content_type() {
            properties = properties.with_content_type(content_type.clone());
        }

        self.publish_confirmed(&self.dead_letter_queue, &delivery.data, properties).await?;
        self.channel
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn publish_confirmed(
        &self,
        destination: &str,
        payload: &[u8],
        properties: BasicProperties,
    ) -> Result<(), ConsumerError> {
        // Default exchange, routed by queue name.
        let confirmation = self
            .channel
            .basic_publish("", destination, BasicPublishOptions::default(), payload, properties)
            .await?
            .await?;

        if confirmation.is_nack() {
            return Err(ConsumerError::BrokerUnavailable(format!(
                "broker refused publish to '{}'",
                destination
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerAdapter for LapinBroker {
    async fn receive(&self) -> Result<Option<Delivery>, ConsumerError> {
        let mut consumer = self.consumer.lock().await;
        while let Some(next) = consumer.next().await {
            let delivery = next?;
            match Self::to_delivery(&delivery) {
                Some(d) => return Ok(Some(d)),
                None => self.dead_letter_unidentified(delivery).await?,
            }
        }
        Ok(None)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), ConsumerError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn publish(&self, destination: &str, message: OutboundMessage) -> Result<(), ConsumerError> {
        let mut properties = BasicProperties::default()
            .with_message_id(message.message_id.into())
            .with_headers(table_from_headers(&message.headers))
            .with_delivery_mode(PERSISTENT);
        if let Some(content_type) = message.content_type {
            properties = properties.with_content_type(content_type.into());
        }

        self.publish_confirmed(destination, &message.payload, properties).await
    }
}

#[async_trait]
impl QueueInspector for LapinBroker {
    async fn message_count(&self, queue: &str) -> Result<u32, ConsumerError> {
        // A passive declare of a missing queue closes its channel, so use a throwaway one.
        let channel = self.connection.create_channel().await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        let _ = channel.close(200, "OK").await;
        Ok(declared?.message_count())
    }
}

/// Declares the durable dead-letter queue, then the durable primary queue whose
/// broker-level dead-lettering is routed to it.
pub async fn declare_queues(
    channel: &Channel,
    primary_queue: &str,
    dead_letter_queue: &str,
) -> Result<(), ConsumerError> {
    channel
        .queue_declare(
            dead_letter_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;

    let mut args = FieldTable::default();
    args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(dead_letter_queue.into()),
    );
    channel
        .queue_declare(
            primary_queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            args,
        )
        .await?;

    log::info!(
        "Queue '{}' and dead-letter queue '{}' are set up.",
        primary_queue,
        dead_letter_queue
    );
    Ok(())
}

/// Maps AMQP headers to broker-neutral ones.
pub fn headers_from_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .map(|(key, value)| (key.as_str().to_string(), from_amqp(value)))
        .collect()
}

/// Maps broker-neutral headers to an AMQP field table.
pub fn table_from_headers(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(key.clone().into(), to_amqp(value));
    }
    table
}

fn from_amqp(value: &AMQPValue) -> HeaderValue {
    match value {
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Timestamp(v) => HeaderValue::Int(i64::try_from(*v).unwrap_or(i64::MAX)),
        AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::DecimalValue(d) => {
            HeaderValue::Float(f64::from(d.value) / 10f64.powi(i32::from(d.scale)))
        }
        AMQPValue::ShortString(v) => HeaderValue::Text(v.as_str().to_string()),
        AMQPValue::LongString(v) => HeaderValue::Text(v.to_string()),
        AMQPValue::ByteArray(v) => HeaderValue::Bytes(v.as_slice().to_vec()),
        AMQPValue::FieldArray(v) => HeaderValue::List(v.as_slice().iter().map(from_amqp).collect()),
        AMQPValue::FieldTable(v) => HeaderValue::Table(headers_from_table(v)),
        AMQPValue::Void => HeaderValue::Void,
    }
}

fn to_amqp(value: &HeaderValue) -> AMQPValue {
    match value {
        // 32-bit when it fits.
        HeaderValue::Int(v) => match i32::try_from(*v) {
            Ok(small) => AMQPValue::LongInt(small),
            Err(_) => AMQPValue::LongLongInt(*v),
        },
        HeaderValue::Float(v) => AMQPValue::Double(*v),
        HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
        HeaderValue::Text(v) => AMQPValue::LongString(v.clone().into()),
        HeaderValue::Bytes(v) => AMQPValue::ByteArray(ByteArray::from(v.clone())),
        HeaderValue::List(items) => {
            AMQPValue::FieldArray(FieldArray::from(items.iter().map(to_amqp).collect::<Vec<_>>()))
        }
        HeaderValue::Table(headers) => AMQPValue::FieldTable(table_from_headers(headers)),
        HeaderValue::Void => AMQPValue::Void,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::{read_attempts, RETRIES_HEADER};

    #[test]
    fn test_integer_widths_are_read_as_attempts() {
        let mut table = FieldTable::default();
        table.insert(RETRIES_HEADER.into(), AMQPValue::LongInt(2));
        assert_eq!(read_attempts(&headers_from_table(&table)), 2);

        let mut table = FieldTable::default();
        table.insert(RETRIES_HEADER.into(), AMQPValue::ShortShortUInt(3));
        assert_eq!(read_attempts(&headers_from_table(&table)), 3);
    }

    #[test]
    fn test_ints_are_written_as_32_bit_when_they_fit() {
        let mut headers = Headers::new();
        headers.insert(RETRIES_HEADER.to_string(), HeaderValue::Int(3));
        headers.insert("big".to_string(), HeaderValue::Int(i64::from(i32::MAX) + 1));

        let table = table_from_headers(&headers);
        assert_eq!(table.inner().get(RETRIES_HEADER), Some(&AMQPValue::LongInt(3)));
        assert_eq!(
            table.inner().get("big"),
            Some(&AMQPValue::LongLongInt(i64::from(i32::MAX) + 1))
        );
    }

    #[test]
    fn test_headers_survive_the_field_table() {
        let mut nested = Headers::new();
        nested.insert("k".to_string(), HeaderValue::Bool(true));

        let mut headers = Headers::new();
        headers.insert(RETRIES_HEADER.to_string(), HeaderValue::Int(4));
        headers.insert("x-error-reason".to_string(), HeaderValue::from("boom"));
        headers.insert("blob".to_string(), HeaderValue::Bytes(vec![1, 2, 3]));
        headers.insert(
            "list".to_string(),
            HeaderValue::List(vec![HeaderValue::Int(1), HeaderValue::from("two")]),
        );
        headers.insert("nested".to_string(), HeaderValue::Table(nested));

        assert_eq!(headers_from_table(&table_from_headers(&headers)), headers);
    }

    #[test]
    fn test_id_envelope_reads_message_id_field() {
        let envelope: IdEnvelope =
            serde_json::from_slice(br#"{"messageId":"m7","payload":"hello"}"#).unwrap();
        assert_eq!(envelope.message_id, "m7");
    }
}
