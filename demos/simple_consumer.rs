use async_trait::async_trait;
use idempotent_rabbitmq_worker::{
    Delivery, FailureInjection, ProcessingCallback, ProcessingError, RabbitRedisConsumer, WorkerConfig,
};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

// 1. Define your message struct
#[derive(Deserialize, Debug, Clone)]
struct CommandMessage {
    #[serde(rename = "messageId")]
    message_id: String,
    payload: serde_json::Value,
    #[serde(rename = "createdAt", default)]
    created_at: Option<String>,
}

// 2. Implement the `ProcessingCallback` trait for your logic
struct CommandProcessor;

#[async_trait]
impl ProcessingCallback for CommandProcessor {
    fn handler_name(&self) -> &str {
        "CommandProcessor"
    }

    async fn process(&self, delivery: &Delivery) -> Result<(), ProcessingError> {
        let message: CommandMessage = serde_json::from_slice(&delivery.payload)
            .map_err(|e| ProcessingError::Fatal(format!("Failed to deserialize message: {}", e)))?;

        log::info!(
            "Processing message with ID: {} (created {}). Payload: {}",
            message.message_id,
            message.created_at.as_deref().unwrap_or("unknown"),
            message.payload
        );
        Ok(())
    }
}

// Roughly 30% of deliveries fail.
fn flaky(_id: &str) -> bool {
    rand::random::<f64>() < 0.3
}

// 3. Configure and run the consumer
#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match WorkerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            log::error!("{}", e);
            return;
        }
    };
    log::info!("Using RabbitMQ at {} and Redis at {}", config.amqp_url, config.redis_url);

    let callback = Arc::new(FailureInjection::new(CommandProcessor, flaky));
    let reconnect_delay = Duration::from_secs(5);

    // The application is in control of the run loop.
    loop {
        let consumer = match RabbitRedisConsumer::connect(&config, callback.clone()).await {
            Ok(consumer) => consumer,
            Err(e) => {
                log::error!("Connection failed: {}. Reconnecting in {:?}...", e, reconnect_delay);
                tokio::time::sleep(reconnect_delay).await;
                continue;
            }
        };

        let status = consumer.queue_status().await;
        log::info!(
            "Queue status: {}",
            serde_json::to_string(&status).unwrap_or_default()
        );

        tokio::select! {
            // Listen for Ctrl+C for graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                log::info!("Ctrl+C received. Shutting down.");
                break;
            },

            result = consumer.run() => {
                match result {
                    Ok(_) => {
                        log::info!("Consumer finished unexpectedly. Will not reconnect.");
                        break;
                    }
                    Err(e) => {
                        log::error!("Consumer failed: {}. Reconnecting in {:?}...", e, reconnect_delay);
                        tokio::time::sleep(reconnect_delay).await;
                    }
                }
            }
        }
    }

    log::info!("Application has shut down.");
}
