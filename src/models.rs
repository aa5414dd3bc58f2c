use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A registered message producer, owned by exactly one project.
///
/// Sends are stateless: the row only carries credentials and the stored
/// routing defaults that per-send requests may override field by field.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Producer {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub project_id: String,
    pub broker: String,
    pub strategy: String,
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    /// JSON object string, used by the `headers` strategy.
    pub headers: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A registered message consumer.
///
/// `persistence_time_ms` is the retention window for delivered messages;
/// zero disables retention entirely.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Consumer {
    pub id: String,
    pub username: String,
    pub password_hash: String,
    pub project_id: String,
    pub persistence_time_ms: i64,
    pub broker: String,
    pub strategy: String,
    pub exchange: Option<String>,
    pub queue: String,
    pub routing_key: Option<String>,
    pub headers: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// The wire envelope published to a backend and handed to downstream
/// collaborators. Field names are part of the wire contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEnvelope {
    pub message_id: String,
    pub data: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, serde_json::Value>>,
}

/// An inbound message stamped by the consumer adapter: the envelope payload
/// plus the receiving consumer, the source queue, and the retention expiry
/// computed at receipt time (absent when retention is disabled).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetainedMessage {
    pub message_id: String,
    pub consumer_id: String,
    pub data: String,
    pub queue: String,
    pub expire_at: Option<DateTime<Utc>>,
}

/// Retention expiry for a message received now. Saturates to the maximum
/// representable instant instead of wrapping; zero or negative retention
/// means no expiry and no persistence.
pub fn retention_expiry(received_at: DateTime<Utc>, persistence_ms: i64) -> Option<DateTime<Utc>> {
    if persistence_ms <= 0 {
        return None;
    }
    Some(
        received_at
            .checked_add_signed(Duration::milliseconds(persistence_ms))
            .unwrap_or(DateTime::<Utc>::MAX_UTC),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_retention_has_no_expiry() {
        assert_eq!(retention_expiry(Utc::now(), 0), None);
        assert_eq!(retention_expiry(Utc::now(), -5), None);
    }

    #[test]
    fn expiry_is_receipt_time_plus_retention() {
        let t0 = Utc::now();
        let expiry = retention_expiry(t0, 60_000).unwrap();
        assert_eq!(expiry, t0 + Duration::milliseconds(60_000));
        assert!(expiry > t0);
    }

    #[test]
    fn expiry_saturates_instead_of_wrapping() {
        let expiry = retention_expiry(Utc::now(), i64::MAX).unwrap();
        assert_eq!(expiry, DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn envelope_uses_camel_case_on_the_wire() {
        let envelope = MessageEnvelope {
            message_id: "m-1".to_string(),
            data: "payload".to_string(),
            headers: None,
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["messageId"], "m-1");
        assert!(json.get("headers").is_none());
    }
}
