use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{AppError, AppResult};
use crate::models::{Consumer, Producer, RetainedMessage};

// ============================================================================
// Response envelope
// ============================================================================

/// Uniform response envelope. `status` is derived, not client-supplied:
/// "SUCCESS" iff the application code is in the 2xx range.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub message: String,
    pub app_code: i32,
    pub data: Option<T>,
    pub status: String,
}

impl<T> ApiResponse<T> {
    pub fn new(message: impl Into<String>, app_code: i32, data: Option<T>) -> Self {
        let status = if (200..300).contains(&app_code) {
            "SUCCESS"
        } else {
            "ERROR"
        };
        Self {
            message: message.into(),
            app_code,
            data,
            status: status.to_string(),
        }
    }

    pub fn ok(message: impl Into<String>, data: T) -> Self {
        Self::new(message, 200, Some(data))
    }

    pub fn created(message: impl Into<String>, data: T) -> Self {
        Self::new(message, 201, Some(data))
    }

    pub fn error(message: impl Into<String>, app_code: i32) -> Self {
        Self::new(message, app_code, None)
    }
}

// ============================================================================
// Input validation
// ============================================================================

const USERNAME_MIN: usize = 8;
const USERNAME_MAX: usize = 32;
const PASSWORD_MIN: usize = 8;
const PASSWORD_MAX: usize = 64;
const PASSWORD_EXTRA_CHARS: &[char] = &['.', '/', '#', '$', '|', '-'];

fn check_username(errors: &mut Vec<String>, username: &str) {
    if username.is_empty() {
        errors.push("Username cannot be empty".to_string());
        return;
    }
    if username.len() < USERNAME_MIN || username.len() > USERNAME_MAX {
        errors.push(format!(
            "Username must be between {} and {} characters",
            USERNAME_MIN, USERNAME_MAX
        ));
    }
    if !username.chars().all(|c| c.is_ascii_alphanumeric()) {
        errors.push("Username must be alphanumeric".to_string());
    }
}

fn check_password(errors: &mut Vec<String>, password: &str) {
    if password.is_empty() {
        errors.push("Password cannot be empty".to_string());
        return;
    }
    if password.len() < PASSWORD_MIN || password.len() > PASSWORD_MAX {
        errors.push(format!(
            "Password must be between {} and {} characters",
            PASSWORD_MIN, PASSWORD_MAX
        ));
    }
    if !password
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || PASSWORD_EXTRA_CHARS.contains(&c))
    {
        errors.push("Password can only contain alphanumeric characters and ./#$|-".to_string());
    }
}

fn check_not_blank(errors: &mut Vec<String>, value: &str, what: &str) {
    if value.trim().is_empty() {
        errors.push(format!("{} cannot be empty", what));
    }
}

/// Collected field violations are reported in one message rather than
/// failing on the first.
fn finish(errors: Vec<String>) -> AppResult<()> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(AppError::Validation(errors.join("; ")))
    }
}

/// Serialize a header map for storage, rejecting empty maps up front.
pub fn headers_to_json(headers: &Option<HashMap<String, serde_json::Value>>) -> Option<String> {
    headers
        .as_ref()
        .filter(|map| !map.is_empty())
        .and_then(|map| serde_json::to_string(map).ok())
}

// ============================================================================
// Producer DTOs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterProducerRequest {
    pub username: String,
    pub password: String,
    pub broker: String,
    pub strategy: String,
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub headers: Option<HashMap<String, serde_json::Value>>,
}

impl RegisterProducerRequest {
    pub fn validate(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        check_username(&mut errors, &self.username);
        check_password(&mut errors, &self.password);
        check_not_blank(&mut errors, &self.broker, "Broker name");
        check_not_blank(&mut errors, &self.strategy, "Strategy");
        finish(errors)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerDto {
    pub id: String,
    pub username: String,
    pub broker: String,
    pub strategy: String,
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub headers: Option<HashMap<String, serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ProducerDto {
    /// Credentials never leave the service.
    pub fn from_model(producer: Producer) -> Self {
        Self {
            id: producer.id,
            username: producer.username,
            broker: producer.broker,
            strategy: producer.strategy,
            exchange: producer.exchange,
            queue: producer.queue,
            routing_key: producer.routing_key,
            headers: parse_stored_headers(producer.headers.as_deref()),
            created_at: producer.created_at,
            updated_at: producer.updated_at,
        }
    }
}

// ============================================================================
// Consumer DTOs
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterConsumerRequest {
    pub username: String,
    pub password: String,
    /// Retention window in milliseconds; zero disables retention.
    pub persistence_time: i64,
    pub broker: String,
    pub strategy: String,
    pub queue: String,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub headers: Option<HashMap<String, serde_json::Value>>,
}

impl RegisterConsumerRequest {
    pub fn validate(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        check_username(&mut errors, &self.username);
        check_password(&mut errors, &self.password);
        check_not_blank(&mut errors, &self.broker, "Broker name");
        check_not_blank(&mut errors, &self.strategy, "Strategy");
        check_not_blank(&mut errors, &self.queue, "Queue name");
        if self.persistence_time < 0 {
            errors.push("Persistence time must be non-negative".to_string());
        }
        finish(errors)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerDto {
    pub id: String,
    pub username: String,
    pub persistence_time: i64,
    pub broker: String,
    pub strategy: String,
    pub queue: String,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub headers: Option<HashMap<String, serde_json::Value>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ConsumerDto {
    pub fn from_model(consumer: Consumer) -> Self {
        Self {
            id: consumer.id,
            username: consumer.username,
            persistence_time: consumer.persistence_time_ms,
            broker: consumer.broker,
            strategy: consumer.strategy,
            queue: consumer.queue,
            exchange: consumer.exchange,
            routing_key: consumer.routing_key,
            headers: parse_stored_headers(consumer.headers.as_deref()),
            created_at: consumer.created_at,
            updated_at: consumer.updated_at,
        }
    }
}

fn parse_stored_headers(raw: Option<&str>) -> Option<HashMap<String, serde_json::Value>> {
    raw.and_then(|s| serde_json::from_str(s).ok())
}

// ============================================================================
// Send & update DTOs
// ============================================================================

/// Per-send message request. Routing fields override the producer's stored
/// defaults field by field; an absent or empty field falls back to the
/// stored value.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub data: String,
    pub strategy: Option<String>,
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub headers: Option<HashMap<String, serde_json::Value>>,
}

impl SendMessageRequest {
    pub fn validate(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        check_not_blank(&mut errors, &self.data, "Message data");
        finish(errors)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerUpdate {
    pub broker: String,
    pub strategy: String,
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub headers: Option<HashMap<String, serde_json::Value>>,
}

impl BrokerUpdate {
    pub fn validate(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        check_not_blank(&mut errors, &self.broker, "Broker name");
        check_not_blank(&mut errors, &self.strategy, "Strategy");
        finish(errors)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StrategyUpdate {
    pub strategy: String,
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub headers: Option<HashMap<String, serde_json::Value>>,
}

impl StrategyUpdate {
    pub fn validate(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        check_not_blank(&mut errors, &self.strategy, "Strategy");
        finish(errors)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueUpdate {
    pub queue: String,
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    pub headers: Option<HashMap<String, serde_json::Value>>,
}

impl QueueUpdate {
    pub fn validate(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        check_not_blank(&mut errors, &self.queue, "Queue name");
        finish(errors)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceUpdate {
    pub persistence_time: i64,
}

impl PersistenceUpdate {
    pub fn validate(&self) -> AppResult<()> {
        let mut errors = Vec::new();
        if self.persistence_time < 0 {
            errors.push("Persistence time must be non-negative".to_string());
        }
        finish(errors)
    }
}

// ============================================================================
// Message DTOs
// ============================================================================

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDto {
    pub message_id: String,
    pub data: String,
    pub queue: String,
    pub expire_at: Option<DateTime<Utc>>,
}

impl MessageDto {
    pub fn from_model(message: RetainedMessage) -> Self {
        Self {
            message_id: message.message_id,
            data: message.data,
            queue: message.queue,
            expire_at: message.expire_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn producer_request() -> RegisterProducerRequest {
        RegisterProducerRequest {
            username: "sensorhub1".to_string(),
            password: "s3cretpass".to_string(),
            broker: "rabbitmq".to_string(),
            strategy: "direct".to_string(),
            exchange: None,
            queue: None,
            routing_key: None,
            headers: None,
        }
    }

    #[test]
    fn valid_registration_passes() {
        assert!(producer_request().validate().is_ok());
    }

    #[test]
    fn violations_are_aggregated_into_one_message() {
        let mut req = producer_request();
        req.username = "ab!".to_string();
        req.broker = " ".to_string();
        let err = req.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Username must be between"));
        assert!(msg.contains("Username must be alphanumeric"));
        assert!(msg.contains("Broker name cannot be empty"));
    }

    #[test]
    fn negative_persistence_time_is_rejected() {
        let update = PersistenceUpdate {
            persistence_time: -1,
        };
        assert!(update.validate().is_err());
        let update = PersistenceUpdate {
            persistence_time: 0,
        };
        assert!(update.validate().is_ok());
    }

    #[test]
    fn status_label_is_derived_from_app_code() {
        let ok = ApiResponse::ok("done", serde_json::json!({}));
        assert_eq!(ok.status, "SUCCESS");
        let created = ApiResponse::<()>::new("made", 201, None);
        assert_eq!(created.status, "SUCCESS");
        let err = ApiResponse::<()>::error("nope", 1404);
        assert_eq!(err.status, "ERROR");
    }

    #[test]
    fn envelope_serializes_camel_case() {
        let body = ApiResponse::<()>::error("nope", 1404);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["appCode"], 1404);
        assert_eq!(json["status"], "ERROR");
    }

    #[test]
    fn empty_header_map_is_stored_as_absent() {
        assert_eq!(headers_to_json(&Some(HashMap::new())), None);
        let mut map = HashMap::new();
        map.insert("region".to_string(), serde_json::json!("north"));
        assert!(headers_to_json(&Some(map)).unwrap().contains("region"));
    }
}
