//! Broker abstraction: routing strategies, per-backend transports, and the
//! registry that selects a transport by backend name.
//!
//! Wire-level broker communication is delegated to the client libraries
//! (lapin, rdkafka); this layer owns strategy validation, topology shape,
//! and the listener lifecycle.

pub mod kafka;
pub mod rabbitmq;
pub mod topology;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{AppError, AppResult};
use crate::models::{Consumer, MessageEnvelope, Producer, RetainedMessage};

pub const BACKEND_RABBITMQ: &str = "rabbitmq";
pub const BACKEND_KAFKA: &str = "kafka";
pub const BACKEND_ACTIVEMQ5: &str = "activemq5";

// ============================================================================
// Routing strategies
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoutingStrategy {
    Direct,
    Topic,
    Fanout,
    Headers,
}

impl RoutingStrategy {
    pub fn parse(raw: &str) -> AppResult<Self> {
        match raw.to_lowercase().as_str() {
            "direct" => Ok(RoutingStrategy::Direct),
            "topic" => Ok(RoutingStrategy::Topic),
            "fanout" => Ok(RoutingStrategy::Fanout),
            "headers" => Ok(RoutingStrategy::Headers),
            other => Err(AppError::IncompatibleStrategy(format!(
                "Unknown strategy '{}'",
                other
            ))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RoutingStrategy::Direct => "direct",
            RoutingStrategy::Topic => "topic",
            RoutingStrategy::Fanout => "fanout",
            RoutingStrategy::Headers => "headers",
        }
    }
}

impl fmt::Display for RoutingStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategies each backend can form a topology for. Unknown backends return
/// `None`: the global allow-list is checked before this table is consulted,
/// so an unknown name here is not an error of this layer.
fn supported_strategies(backend: &str) -> Option<&'static [RoutingStrategy]> {
    match backend.to_lowercase().as_str() {
        BACKEND_RABBITMQ => Some(&[
            RoutingStrategy::Direct,
            RoutingStrategy::Topic,
            RoutingStrategy::Fanout,
            RoutingStrategy::Headers,
        ]),
        BACKEND_KAFKA => Some(&[RoutingStrategy::Topic]),
        BACKEND_ACTIVEMQ5 => Some(&[RoutingStrategy::Direct, RoutingStrategy::Topic]),
        _ => None,
    }
}

pub fn validate_strategy(backend: &str, strategy: RoutingStrategy) -> AppResult<()> {
    match supported_strategies(backend) {
        Some(supported) if supported.contains(&strategy) => Ok(()),
        Some(_) => Err(AppError::IncompatibleStrategy(format!(
            "Backend '{}' does not support strategy '{}'",
            backend, strategy
        ))),
        None => Ok(()),
    }
}

// ============================================================================
// Resolved broker configuration
// ============================================================================

/// The routing configuration a transport operates with: either a consumer's
/// stored fields or a producer's stored fields merged with per-send
/// overrides.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub backend: String,
    pub strategy: RoutingStrategy,
    pub exchange: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    /// JSON object string, as stored.
    pub headers: Option<String>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl BrokerConfig {
    pub fn from_producer(producer: &Producer) -> AppResult<Self> {
        Ok(Self {
            backend: producer.broker.to_lowercase(),
            strategy: RoutingStrategy::parse(&producer.strategy)?,
            exchange: producer.exchange.clone(),
            queue: producer.queue.clone(),
            routing_key: producer.routing_key.clone(),
            headers: producer.headers.clone(),
        })
    }

    pub fn from_consumer(consumer: &Consumer) -> AppResult<Self> {
        Ok(Self {
            backend: consumer.broker.to_lowercase(),
            strategy: RoutingStrategy::parse(&consumer.strategy)?,
            exchange: consumer.exchange.clone(),
            queue: Some(consumer.queue.clone()),
            routing_key: consumer.routing_key.clone(),
            headers: consumer.headers.clone(),
        })
    }

    pub fn exchange(&self) -> AppResult<&str> {
        non_empty(&self.exchange).ok_or_else(|| {
            AppError::IncompatibleStrategy(
                "Exchange name is required for this strategy".to_string(),
            )
        })
    }

    pub fn queue(&self) -> AppResult<&str> {
        non_empty(&self.queue).ok_or_else(|| {
            AppError::IncompatibleStrategy("Queue name is required for this strategy".to_string())
        })
    }

    /// Parse the stored header map; required, non-empty, and a JSON object
    /// for the `headers` strategy.
    pub fn headers_map(&self) -> AppResult<HashMap<String, serde_json::Value>> {
        let raw = self.headers.as_deref().unwrap_or_default();
        if raw.trim().is_empty() {
            return Err(AppError::IncompatibleStrategy(
                "Headers are mandatory for 'headers' strategy".to_string(),
            ));
        }
        let map: HashMap<String, serde_json::Value> = serde_json::from_str(raw).map_err(|_| {
            AppError::IncompatibleStrategy(
                "Headers must be a valid JSON object for 'headers' strategy".to_string(),
            )
        })?;
        if map.is_empty() {
            return Err(AppError::IncompatibleStrategy(
                "Headers are mandatory for 'headers' strategy".to_string(),
            ));
        }
        Ok(map)
    }

    /// Per-strategy field requirements, checked before any topology is
    /// declared. The routing-key and header rules hold regardless of
    /// backend; the exchange requirement is skipped for Kafka, which has no
    /// exchange concept.
    pub fn validate_routing(&self) -> AppResult<()> {
        self.queue()?;
        if self.backend != BACKEND_KAFKA {
            self.exchange()?;
        }
        match self.strategy {
            RoutingStrategy::Direct | RoutingStrategy::Fanout => Ok(()),
            RoutingStrategy::Topic => {
                if non_empty(&self.routing_key).is_none() {
                    return Err(AppError::IncompatibleStrategy(
                        "Routing key is mandatory for 'topic' strategy".to_string(),
                    ));
                }
                Ok(())
            }
            RoutingStrategy::Headers => self.headers_map().map(|_| ()),
        }
    }

    /// The routing key a message is published (and a binding formed) with:
    /// `direct` defaults to the queue name when unset, `topic` uses the
    /// mandatory key, `fanout`/`headers` route without one.
    pub fn resolved_routing_key(&self) -> AppResult<String> {
        match self.strategy {
            RoutingStrategy::Direct => Ok(non_empty(&self.routing_key)
                .map(str::to_string)
                .unwrap_or(self.queue()?.to_string())),
            RoutingStrategy::Topic => Ok(non_empty(&self.routing_key)
                .ok_or_else(|| {
                    AppError::IncompatibleStrategy(
                        "Routing key is mandatory for 'topic' strategy".to_string(),
                    )
                })?
                .to_string()),
            RoutingStrategy::Fanout | RoutingStrategy::Headers => Ok(String::new()),
        }
    }
}

// ============================================================================
// Transport seams
// ============================================================================

/// Callback invoked by a consumer transport for every decoded inbound
/// message. Runs on the transport's own dispatch task, concurrently with
/// API-driven operations on the same consumer.
pub type DeliveryHandler = Arc<dyn Fn(RetainedMessage) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait]
pub trait ProducerTransport: Send + Sync {
    /// Pre-flight hook for backends that keep pooled connections. Allowed
    /// to allocate resources but not required to.
    async fn connect(&self, config: &BrokerConfig) -> AppResult<()>;

    /// Validate routing, ensure topology, publish one message.
    async fn send(&self, envelope: &MessageEnvelope, config: &BrokerConfig) -> AppResult<()>;

    /// Release per-producer resources; safe to call when nothing is open.
    async fn close(&self, producer_id: &str);
}

impl fmt::Debug for dyn ProducerTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn ProducerTransport")
    }
}

#[async_trait]
pub trait ConsumerTransport: Send + Sync {
    /// Attach a listener for this consumer, replacing (stop-then-start) any
    /// existing listener for the same consumer id.
    async fn connect_and_listen(
        &self,
        consumer: &Consumer,
        handler: DeliveryHandler,
    ) -> AppResult<()>;

    /// Stop and remove this consumer's listener. Idempotent; returns
    /// whether a listener was actually removed.
    async fn close(&self, consumer_id: &str) -> bool;
}

/// Transport lookup keyed on backend name. A backend may be globally
/// permitted yet have no transport wired on this instance; that is the
/// distinct "not supported by this service instance" error path.
#[derive(Default)]
pub struct BrokerRegistry {
    producers: HashMap<String, Arc<dyn ProducerTransport>>,
    consumers: HashMap<String, Arc<dyn ConsumerTransport>>,
}

impl BrokerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_producer(&mut self, backend: &str, transport: Arc<dyn ProducerTransport>) {
        self.producers.insert(backend.to_lowercase(), transport);
    }

    pub fn register_consumer(&mut self, backend: &str, transport: Arc<dyn ConsumerTransport>) {
        self.consumers.insert(backend.to_lowercase(), transport);
    }

    pub fn producer(&self, backend: &str) -> AppResult<Arc<dyn ProducerTransport>> {
        self.producers
            .get(&backend.to_lowercase())
            .cloned()
            .ok_or_else(|| not_wired(backend))
    }

    pub fn consumer(&self, backend: &str) -> AppResult<Arc<dyn ConsumerTransport>> {
        self.consumers
            .get(&backend.to_lowercase())
            .cloned()
            .ok_or_else(|| not_wired(backend))
    }
}

fn not_wired(backend: &str) -> AppError {
    AppError::BrokerNotSupported(format!(
        "Broker '{}' is not supported by this service instance",
        backend
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(strategy: RoutingStrategy) -> BrokerConfig {
        BrokerConfig {
            backend: BACKEND_RABBITMQ.to_string(),
            strategy,
            exchange: Some("ex".to_string()),
            queue: Some("q1".to_string()),
            routing_key: None,
            headers: None,
        }
    }

    #[test]
    fn every_pair_outside_the_support_table_rejects() {
        let all = [
            RoutingStrategy::Direct,
            RoutingStrategy::Topic,
            RoutingStrategy::Fanout,
            RoutingStrategy::Headers,
        ];
        for strategy in all {
            assert!(validate_strategy(BACKEND_RABBITMQ, strategy).is_ok());
        }
        for strategy in [
            RoutingStrategy::Direct,
            RoutingStrategy::Fanout,
            RoutingStrategy::Headers,
        ] {
            assert!(matches!(
                validate_strategy(BACKEND_KAFKA, strategy),
                Err(AppError::IncompatibleStrategy(_))
            ));
        }
        assert!(validate_strategy(BACKEND_KAFKA, RoutingStrategy::Topic).is_ok());
        for strategy in [RoutingStrategy::Fanout, RoutingStrategy::Headers] {
            assert!(matches!(
                validate_strategy(BACKEND_ACTIVEMQ5, strategy),
                Err(AppError::IncompatibleStrategy(_))
            ));
        }
        assert!(validate_strategy(BACKEND_ACTIVEMQ5, RoutingStrategy::Direct).is_ok());
        assert!(validate_strategy(BACKEND_ACTIVEMQ5, RoutingStrategy::Topic).is_ok());
    }

    #[test]
    fn backend_names_are_case_insensitive() {
        assert!(validate_strategy("RabbitMQ", RoutingStrategy::Headers).is_ok());
        assert!(validate_strategy("KAFKA", RoutingStrategy::Fanout).is_err());
    }

    #[test]
    fn unknown_strategy_name_rejects() {
        assert!(matches!(
            RoutingStrategy::parse("broadcast"),
            Err(AppError::IncompatibleStrategy(_))
        ));
        assert_eq!(
            RoutingStrategy::parse("TOPIC").unwrap(),
            RoutingStrategy::Topic
        );
    }

    #[test]
    fn topic_without_routing_key_rejects_regardless_of_backend() {
        for backend in [BACKEND_RABBITMQ, BACKEND_KAFKA, BACKEND_ACTIVEMQ5] {
            let mut cfg = config(RoutingStrategy::Topic);
            cfg.backend = backend.to_string();
            assert!(
                matches!(cfg.validate_routing(), Err(AppError::IncompatibleStrategy(_))),
                "backend {} accepted topic without a routing key",
                backend
            );
        }
        let mut cfg = config(RoutingStrategy::Topic);
        cfg.routing_key = Some("orders.*".to_string());
        assert!(cfg.validate_routing().is_ok());
    }

    #[test]
    fn headers_strategy_requires_a_well_formed_map() {
        let mut cfg = config(RoutingStrategy::Headers);
        assert!(cfg.validate_routing().is_err());

        cfg.headers = Some("{}".to_string());
        assert!(cfg.validate_routing().is_err());

        cfg.headers = Some("not json".to_string());
        assert!(cfg.validate_routing().is_err());

        cfg.headers = Some(r#"{"region":"north"}"#.to_string());
        assert!(cfg.validate_routing().is_ok());
    }

    #[test]
    fn direct_routing_key_defaults_to_the_queue_name() {
        let cfg = config(RoutingStrategy::Direct);
        assert_eq!(cfg.resolved_routing_key().unwrap(), "q1");

        let mut cfg = config(RoutingStrategy::Direct);
        cfg.routing_key = Some("explicit".to_string());
        assert_eq!(cfg.resolved_routing_key().unwrap(), "explicit");
    }

    #[test]
    fn fanout_and_headers_route_without_a_key() {
        let cfg = config(RoutingStrategy::Fanout);
        assert_eq!(cfg.resolved_routing_key().unwrap(), "");

        let mut cfg = config(RoutingStrategy::Headers);
        cfg.headers = Some(r#"{"k":"v"}"#.to_string());
        assert_eq!(cfg.resolved_routing_key().unwrap(), "");
    }

    #[test]
    fn missing_exchange_or_queue_rejects() {
        let mut cfg = config(RoutingStrategy::Direct);
        cfg.exchange = None;
        assert!(cfg.validate_routing().is_err());

        let mut cfg = config(RoutingStrategy::Direct);
        cfg.queue = Some("  ".to_string());
        assert!(cfg.validate_routing().is_err());
    }

    #[test]
    fn kafka_does_not_require_an_exchange() {
        let cfg = BrokerConfig {
            backend: BACKEND_KAFKA.to_string(),
            strategy: RoutingStrategy::Topic,
            exchange: None,
            queue: Some("telemetry".to_string()),
            routing_key: Some("telemetry".to_string()),
            headers: None,
        };
        assert!(cfg.validate_routing().is_ok());
    }

    #[test]
    fn unwired_backend_is_a_distinct_error() {
        let registry = BrokerRegistry::new();
        let err = registry.producer(BACKEND_ACTIVEMQ5).unwrap_err();
        assert!(matches!(err, AppError::BrokerNotSupported(_)));
    }
}
