//! Kafka transports built on rdkafka. Kafka serves only the `topic`
//! strategy: the configured queue name is the topic, there is no exchange
//! or binding to declare, and topics are auto-created by the cluster.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer as _, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use rdkafka::Message as _;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{BrokerConfig, ConsumerTransport, DeliveryHandler, ProducerTransport};
use crate::config::KafkaConfig;
use crate::error::{AppError, AppResult};
use crate::metrics;
use crate::models::{retention_expiry, Consumer, MessageEnvelope, RetainedMessage};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Producer
// ============================================================================

pub struct KafkaProducer {
    producer: FutureProducer,
}

impl KafkaProducer {
    /// At-least-once settings: all in-sync replicas acknowledge and the
    /// producer session is idempotent.
    pub fn new(config: &KafkaConfig) -> AppResult<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .set("message.timeout.ms", "30000")
            .create()?;
        tracing::info!(brokers = %config.brokers, "Kafka producer initialized");
        Ok(Self { producer })
    }
}

#[async_trait]
impl ProducerTransport for KafkaProducer {
    async fn connect(&self, config: &BrokerConfig) -> AppResult<()> {
        config.validate_routing()?;
        Ok(())
    }

    async fn send(&self, envelope: &MessageEnvelope, config: &BrokerConfig) -> AppResult<()> {
        config.validate_routing()?;
        let topic = config.queue()?;
        let payload = serde_json::to_vec(envelope)?;

        let record = FutureRecord::to(topic)
            .key(envelope.message_id.as_bytes())
            .payload(&payload);

        self.producer
            .send(record, Timeout::After(SEND_TIMEOUT))
            .await
            .map_err(|(e, _)| AppError::SendFailed(e.to_string()))?;

        metrics::MESSAGES_PUBLISHED_TOTAL.inc();
        tracing::info!(
            message_id = %envelope.message_id,
            topic = %topic,
            "Message published to Kafka"
        );
        Ok(())
    }

    async fn close(&self, producer_id: &str) {
        tracing::debug!(producer_id = %producer_id, "Kafka producer close (no-op)");
    }
}

// ============================================================================
// Consumer
// ============================================================================

pub struct KafkaListener {
    brokers: String,
    listeners: DashMap<String, JoinHandle<()>>,
    attach_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KafkaListener {
    pub fn new(config: &KafkaConfig) -> Self {
        Self {
            brokers: config.brokers.clone(),
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

    fn detach(&self, consumer_id: &str) -> bool {
        if let Some((_, task)) = self.listeners.remove(consumer_id) {
            // Aborting the task drops the StreamConsumer, which leaves the
            // group cleanly.
            task.abort();
            tracing::info!(consumer_id = %consumer_id, "Kafka listener stopped");
            true
        } else {
            false
        }
    }
}

#[async_trait]
impl ConsumerTransport for KafkaListener {
    async fn connect_and_listen(
        &self,
        consumer: &Consumer,
        handler: DeliveryHandler,
    ) -> AppResult<()> {
        let lock = self.attach_lock(&consumer.id);
        let _guard = lock.lock().await;

        self.detach(&consumer.id);

        let config = BrokerConfig::from_consumer(consumer)?;
        config.validate_routing()?;
        let topic = config.queue()?.to_string();

        // One group per consumer id so every registered consumer sees the
        // full topic stream.
        let stream: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", &self.brokers)
            .set("group.id", format!("courier-{}", consumer.id))
            .set("enable.auto.commit", "true")
            .set("auto.offset.reset", "latest")
            .create()?;
        stream.subscribe(&[&topic])?;

        let consumer_id = consumer.id.clone();
        let persistence_ms = consumer.persistence_time_ms;
        let task_topic = topic.clone();
        let task = tokio::spawn(async move {
            loop {
                match stream.recv().await {
                    Ok(borrowed) => {
                        let Some(payload) = borrowed.payload() else {
                            tracing::warn!(consumer_id = %consumer_id, "Kafka message without payload");
                            continue;
                        };
                        match serde_json::from_slice::<MessageEnvelope>(payload) {
                            Ok(envelope) => {
                                let message = RetainedMessage {
                                    message_id: envelope.message_id,
                                    consumer_id: consumer_id.clone(),
                                    data: envelope.data,
                                    queue: task_topic.clone(),
                                    expire_at: retention_expiry(Utc::now(), persistence_ms),
                                };
                                handler(message).await;
                            }
                            Err(e) => {
                                tracing::warn!(
                                    consumer_id = %consumer_id,
                                    error = %e,
                                    "Dropping undecodable Kafka message"
                                );
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!(consumer_id = %consumer_id, error = %e, "Kafka consumer error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        self.listeners.insert(consumer.id.clone(), task);
        tracing::info!(consumer_id = %consumer.id, topic = %topic, "Kafka listener attached");
        Ok(())
    }

    async fn close(&self, consumer_id: &str) -> bool {
        let lock = self.attach_lock(consumer_id);
        let _guard = lock.lock().await;
        self.detach(consumer_id)
    }
}
