//! Consumer connect/disconnect events for the replica registry.
//!
//! Fire-and-forget: publish failures are logged and swallowed, they never
//! fail the operation that triggered them.

use lapin::options::{BasicPublishOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ExchangeKind};
use serde::Serialize;

/// Must match the replica registry's own declaration of this exchange.
const CONNECTION_EVENTS_EXCHANGE: &str = "consumer.connection.events";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventType {
    Connected,
    Disconnected,
}

impl ConnectionEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionEventType::Connected => "CONNECTED",
            ConnectionEventType::Disconnected => "DISCONNECTED",
        }
    }

    fn routing_key(&self) -> String {
        format!(
            "{}.{}",
            CONNECTION_EVENTS_EXCHANGE,
            self.as_str().to_lowercase()
        )
    }
}

/// Wire shape consumed by the replica registry.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ConsumerConnectionEvent<'a> {
    consumer_id: &'a str,
    project_id: &'a str,
    replica_ip: &'a str,
    event_type: &'a str,
}

pub struct ConnectionEventPublisher {
    channel: Option<Channel>,
    replica_addr: String,
}

impl ConnectionEventPublisher {
    pub async fn new(connection: &Connection, replica_addr: String) -> anyhow::Result<Self> {
        let channel = connection.create_channel().await?;
        channel
            .exchange_declare(
                CONNECTION_EVENTS_EXCHANGE,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(Self {
            channel: Some(channel),
            replica_addr,
        })
    }

    /// A publisher that drops every event. Used when events are disabled
    /// and in tests that have no broker.
    pub fn disabled() -> Self {
        Self {
            channel: None,
            replica_addr: String::new(),
        }
    }

    pub async fn publish(&self, consumer_id: &str, project_id: &str, event: ConnectionEventType) {
        let Some(channel) = &self.channel else {
            tracing::trace!(consumer_id = %consumer_id, event = event.as_str(), "Connection events disabled");
            return;
        };

        let body = ConsumerConnectionEvent {
            consumer_id,
            project_id,
            replica_ip: &self.replica_addr,
            event_type: event.as_str(),
        };
        let payload = match serde_json::to_vec(&body) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "Failed to serialize connection event");
                return;
            }
        };

        let publish = channel
            .basic_publish(
                CONNECTION_EVENTS_EXCHANGE,
                &event.routing_key(),
                BasicPublishOptions::default(),
                &payload,
                BasicProperties::default().with_content_type("application/json".into()),
            )
            .await;

        match publish {
            Ok(_) => {
                tracing::debug!(
                    consumer_id = %consumer_id,
                    project_id = %project_id,
                    event = event.as_str(),
                    "Published consumer connection event"
                );
            }
            Err(e) => {
                tracing::warn!(
                    consumer_id = %consumer_id,
                    event = event.as_str(),
                    error = %e,
                    "Failed to publish consumer connection event"
                );
            }
        }
    }
}
