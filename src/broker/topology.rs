//! Topology lifecycle: the process-wide declared-name cache and the
//! idempotent AMQP exchange/queue/binding declaration built on it.

use dashmap::DashMap;
use lapin::options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions};
use lapin::types::{AMQPValue, FieldTable};
use lapin::{Channel, ExchangeKind};
use std::collections::HashMap;

use super::{BrokerConfig, RoutingStrategy};
use crate::error::{AppError, AppResult};

/// Tracks the strategy every exchange and queue name was first declared
/// with, per backend. Declarations are append-only for the lifetime of the
/// process; a name can never change type. A conflicting redeclaration is a
/// fatal configuration error, not a retryable one.
#[derive(Default)]
pub struct TopologyCache {
    declared: DashMap<(String, String), RoutingStrategy>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns whether `name` is already declared under `strategy`, or the
    /// conflict error if it was declared with a different one.
    pub fn check(&self, backend: &str, name: &str, strategy: RoutingStrategy) -> AppResult<bool> {
        match self.declared.get(&(backend.to_string(), name.to_string())) {
            Some(existing) if *existing == strategy => Ok(true),
            Some(existing) => Err(AppError::TopologyConflict(format!(
                "'{}' was declared as '{}' and cannot be redeclared as '{}'",
                name, *existing, strategy
            ))),
            None => Ok(false),
        }
    }

    /// Record a successful declaration. Called only after the backend
    /// accepted it, mirroring the check-declare-mark sequence so a failed
    /// declaration never poisons the cache.
    pub fn mark(&self, backend: &str, name: &str, strategy: RoutingStrategy) {
        self.declared
            .insert((backend.to_string(), name.to_string()), strategy);
    }
}

fn exchange_kind(strategy: RoutingStrategy) -> ExchangeKind {
    match strategy {
        RoutingStrategy::Direct => ExchangeKind::Direct,
        RoutingStrategy::Topic => ExchangeKind::Topic,
        RoutingStrategy::Fanout => ExchangeKind::Fanout,
        RoutingStrategy::Headers => ExchangeKind::Headers,
    }
}

pub(super) fn amqp_value(value: &serde_json::Value) -> AMQPValue {
    match value {
        serde_json::Value::String(s) => AMQPValue::LongString(s.as_str().into()),
        serde_json::Value::Bool(b) => AMQPValue::Boolean(*b),
        serde_json::Value::Number(n) if n.is_i64() => {
            AMQPValue::LongLongInt(n.as_i64().unwrap_or_default())
        }
        serde_json::Value::Number(n) => AMQPValue::Double(n.as_f64().unwrap_or_default()),
        other => AMQPValue::LongString(other.to_string().into()),
    }
}

/// Binding arguments for a headers exchange: match-any semantics over the
/// supplied header map.
fn header_match_args(headers: &HashMap<String, serde_json::Value>) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert("x-match".into(), AMQPValue::LongString("any".into()));
    for (key, value) in headers {
        args.insert(key.as_str().into(), amqp_value(value));
    }
    args
}

/// Declare the exchange, durable queue, and strategy-shaped binding for
/// `config`, consulting the cache first. Each step is idempotent; the
/// resolved routing key is returned for the subsequent publish or consume.
///
/// The cache is marked only after the backend accepts each declaration, so
/// concurrent declarations of the same name converge and a broker-side
/// failure surfaces to the caller instead of being remembered as success.
pub async fn ensure_amqp_topology(
    channel: &Channel,
    cache: &TopologyCache,
    config: &BrokerConfig,
) -> AppResult<String> {
    config.validate_routing()?;
    let exchange = config.exchange()?.to_string();
    let queue = config.queue()?.to_string();

    let exchange_known = cache.check(&config.backend, &exchange, config.strategy)?;
    cache.check(&config.backend, &queue, config.strategy)?;

    if !exchange_known {
        channel
            .exchange_declare(
                &exchange,
                exchange_kind(config.strategy),
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        cache.mark(&config.backend, &exchange, config.strategy);
    }

    channel
        .queue_declare(
            &queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await?;
    cache.mark(&config.backend, &queue, config.strategy);

    let routing_key = config.resolved_routing_key()?;
    let bind_args = match config.strategy {
        RoutingStrategy::Headers => header_match_args(&config.headers_map()?),
        _ => FieldTable::default(),
    };
    channel
        .queue_bind(
            &queue,
            &exchange,
            &routing_key,
            QueueBindOptions::default(),
            bind_args,
        )
        .await?;

    Ok(routing_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BACKEND_RABBITMQ;

    #[test]
    fn first_declaration_is_unknown_then_remembered() {
        let cache = TopologyCache::new();
        assert!(!cache
            .check(BACKEND_RABBITMQ, "orders", RoutingStrategy::Direct)
            .unwrap());
        cache.mark(BACKEND_RABBITMQ, "orders", RoutingStrategy::Direct);
        assert!(cache
            .check(BACKEND_RABBITMQ, "orders", RoutingStrategy::Direct)
            .unwrap());
    }

    #[test]
    fn same_strategy_redeclaration_is_idempotent() {
        let cache = TopologyCache::new();
        cache.mark(BACKEND_RABBITMQ, "events", RoutingStrategy::Topic);
        for _ in 0..3 {
            assert!(cache
                .check(BACKEND_RABBITMQ, "events", RoutingStrategy::Topic)
                .unwrap());
        }
    }

    #[test]
    fn conflicting_redeclaration_is_fatal() {
        let cache = TopologyCache::new();
        cache.mark(BACKEND_RABBITMQ, "orders", RoutingStrategy::Direct);
        let err = cache
            .check(BACKEND_RABBITMQ, "orders", RoutingStrategy::Fanout)
            .unwrap_err();
        assert!(matches!(err, AppError::TopologyConflict(_)));
        // Still declared under the original strategy afterwards.
        assert!(cache
            .check(BACKEND_RABBITMQ, "orders", RoutingStrategy::Direct)
            .unwrap());
    }

    #[test]
    fn names_are_scoped_per_backend() {
        let cache = TopologyCache::new();
        cache.mark(BACKEND_RABBITMQ, "orders", RoutingStrategy::Direct);
        assert!(cache
            .check("activemq5", "orders", RoutingStrategy::Fanout)
            .is_ok());
    }

    #[test]
    fn header_args_use_match_any() {
        use lapin::types::ShortString;

        let mut headers = HashMap::new();
        headers.insert("region".to_string(), serde_json::json!("north"));
        headers.insert("priority".to_string(), serde_json::json!(3));
        let args = header_match_args(&headers);
        let inner = args.inner();
        assert_eq!(
            inner.get(&ShortString::from("x-match")),
            Some(&AMQPValue::LongString("any".into()))
        );
        assert_eq!(
            inner.get(&ShortString::from("priority")),
            Some(&AMQPValue::LongLongInt(3))
        );
        assert_eq!(
            inner.get(&ShortString::from("region")),
            Some(&AMQPValue::LongString("north".into()))
        );
    }
}
