//! Queue depth reporting for health and status endpoints.

use crate::broker::QueueInspector;
use serde::Serialize;

/// Message counts of the primary and dead-letter queues.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub primary_queue: u32,
    #[serde(rename = "poisonQueue")]
    pub dead_letter_queue: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Inspects both queues. Never fails: an inspection error is reported as
/// zero counts plus the error text.
pub async fn queue_status<I: QueueInspector + ?Sized>(
    inspector: &I,
    primary_queue: &str,
    dead_letter_queue: &str,
) -> QueueStatus {
    let counts = async {
        let primary = inspector.message_count(primary_queue).await?;
        let dead = inspector.message_count(dead_letter_queue).await?;
        Ok::<_, crate::error::ConsumerError>((primary, dead))
    };

    match counts.await {
        Ok((primary_queue, dead_letter_queue)) => QueueStatus {
            primary_queue,
            dead_letter_queue,
            error: None,
        },
        Err(e) => {
            log::warn!("Queue status inspection failed: {}", e);
            QueueStatus {
                error: Some(e.to_string()),
                ..Default::default()
            }
        }
    }
}
