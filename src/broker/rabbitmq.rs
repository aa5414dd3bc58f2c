//! RabbitMQ transports built on lapin. The producer publishes with
//! confirms over short-lived channels; the consumer owns the per-id
//! listener registry with replace-then-recreate semantics.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use futures_util::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::topology::{ensure_amqp_topology, TopologyCache};
use super::{BrokerConfig, ConsumerTransport, DeliveryHandler, ProducerTransport, RoutingStrategy};
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{retention_expiry, Consumer, MessageEnvelope, RetainedMessage};

/// Topology declaration failures keep their fatal identity; plain broker
/// I/O becomes a send failure the caller may retry.
fn as_send_failure(err: AppError) -> AppError {
    match err {
        AppError::Broker(msg) => AppError::SendFailed(msg),
        other => other,
    }
}

// ============================================================================
// Producer
// ============================================================================

pub struct RabbitMqProducer {
    connection: Arc<Connection>,
    topology: Arc<TopologyCache>,
}

impl RabbitMqProducer {
    pub fn new(connection: Arc<Connection>, topology: Arc<TopologyCache>) -> Self {
        Self {
            connection,
            topology,
        }
    }
}

#[async_trait]
impl ProducerTransport for RabbitMqProducer {
    /// lapin multiplexes channels over one pooled connection; connect only
    /// pre-validates the routing configuration.
    async fn connect(&self, config: &BrokerConfig) -> AppResult<()> {
        config.validate_routing()?;
        tracing::debug!(backend = %config.backend, "RabbitMQ producer configuration validated");
        Ok(())
    }

    async fn send(&self, envelope: &MessageEnvelope, config: &BrokerConfig) -> AppResult<()> {
        config.validate_routing()?;

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| AppError::SendFailed(e.to_string()))?;

        let routing_key = ensure_amqp_topology(&channel, &self.topology, config)
            .await
            .map_err(as_send_failure)?;

        let payload = serde_json::to_vec(envelope)?;
        let mut properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_message_id(envelope.message_id.as_str().into());

        // Fanout and headers exchanges publish without a routing key; for
        // the headers strategy the match metadata travels in the message
        // headers instead.
        if config.strategy == RoutingStrategy::Headers {
            let mut table = FieldTable::default();
            for (key, value) in config.headers_map()? {
                table.insert(key.as_str().into(), super::topology::amqp_value(&value));
            }
            properties = properties.with_headers(table);
        }

        let exchange = config.exchange()?;
        channel
            .basic_publish(
                exchange,
                &routing_key,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| AppError::SendFailed(e.to_string()))?
            .await
            .map_err(|e| AppError::SendFailed(e.to_string()))?;

        metrics::MESSAGES_PUBLISHED_TOTAL.inc();
        tracing::info!(
            message_id = %envelope.message_id,
            exchange = %exchange,
            strategy = %config.strategy,
            "Message published to RabbitMQ"
        );
        Ok(())
    }

    /// Channels are per-operation; there is nothing held per producer.
    async fn close(&self, producer_id: &str) {
        tracing::debug!(producer_id = %producer_id, "RabbitMQ producer close (no-op)");
    }
}

// ============================================================================
// Consumer
// ============================================================================

struct ListenerHandle {
    channel: Channel,
    consumer_tag: String,
    task: JoinHandle<()>,
}

pub struct RabbitMqConsumer {
    connection: Arc<Connection>,
    topology: Arc<TopologyCache>,
    listeners: DashMap<String, ListenerHandle>,
    /// Serializes attach/detach per consumer id so replace is an atomic
    /// detach-then-attach sequence.
    attach_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RabbitMqConsumer {
    pub fn new(connection: Arc<Connection>, topology: Arc<TopologyCache>) -> Self {
        Self {
            connection,
            topology,
            listeners: DashMap::new(),
            attach_locks: DashMap::new(),
        }
    }

    fn attach_lock(&self, consumer_id: &str) -> Arc<Mutex<()>> {
        self.attach_locks
            .entry(consumer_id.to_string())
            .or_default()
            .clone()
    }

    /// Stop and drop the listener for this id, if any. Callers hold the
    /// per-id attach lock.
    async fn detach(&self, consumer_id: &str) -> bool {
        let Some((_, handle)) = self.listeners.remove(consumer_id) else {
            return false;
        };
        if let Err(e) = handle
            .channel
            .basic_cancel(&handle.consumer_tag, BasicCancelOptions::default())
            .await
        {
            tracing::debug!(consumer_id = %consumer_id, error = %e, "basic_cancel failed during detach");
        }
        handle.task.abort();
        tracing::info!(consumer_id = %consumer_id, "RabbitMQ listener stopped");
        true
    }
}

#[async_trait]
impl ConsumerTransport for RabbitMqConsumer {
    async fn connect_and_listen(
        &self,
        consumer: &Consumer,
        handler: DeliveryHandler,
    ) -> AppResult<()> {
        let lock = self.attach_lock(&consumer.id);
        let _guard = lock.lock().await;

        // Replace semantics: the old listener is fully stopped before the
        // new one exists, never two listeners for one id.
        self.detach(&consumer.id).await;

        let config = BrokerConfig::from_consumer(consumer)?;
        config.validate_routing()?;

        let channel = self.connection.create_channel().await?;
        ensure_amqp_topology(&channel, &self.topology, &config).await?;

        let queue = config.queue()?.to_string();
        let consumer_tag = format!("courier-{}", consumer.id);
        let mut deliveries = channel
            .basic_consume(
                &queue,
                &consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        let consumer_id = consumer.id.clone();
        let persistence_ms = consumer.persistence_time_ms;
        let task_queue = queue.clone();
        let task = tokio::spawn(async move {
            while let Some(next) = deliveries.next().await {
                let delivery = match next {
                    Ok(delivery) => delivery,
                    Err(e) => {
                        tracing::warn!(consumer_id = %consumer_id, error = %e, "RabbitMQ delivery stream error");
                        break;
                    }
                };

                match serde_json::from_slice::<MessageEnvelope>(&delivery.data) {
                    Ok(envelope) => {
                        let message = RetainedMessage {
                            message_id: envelope.message_id,
                            consumer_id: consumer_id.clone(),
                            data: envelope.data,
                            queue: task_queue.clone(),
                            expire_at: retention_expiry(Utc::now(), persistence_ms),
                        };
                        handler(message).await;
                    }
                    Err(e) => {
                        tracing::warn!(
                            consumer_id = %consumer_id,
                            error = %e,
                            "Dropping undecodable broker message"
                        );
                    }
                }

                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    tracing::warn!(consumer_id = %consumer_id, error = %e, "Failed to ack delivery");
                }
            }
            tracing::debug!(consumer_id = %consumer_id, "RabbitMQ delivery stream ended");
        });

        self.listeners.insert(
            consumer.id.clone(),
            ListenerHandle {
                channel,
                consumer_tag,
                task,
            },
        );
        tracing::info!(consumer_id = %consumer.id, queue = %queue, "RabbitMQ listener attached");
        Ok(())
    }

    async fn close(&self, consumer_id: &str) -> bool {
        let lock = self.attach_lock(consumer_id);
        let _guard = lock.lock().await;
        self.detach(consumer_id).await
    }
}
