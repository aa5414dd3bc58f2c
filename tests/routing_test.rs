//! Black-box checks of the routing rules exposed by the library: the
//! backend/strategy table, per-strategy field requirements, the declared-
//! topology cache, and retention arithmetic.

use chrono::{DateTime, Duration, Utc};

use courier_server::broker::topology::TopologyCache;
use courier_server::broker::{
    self, BrokerConfig, RoutingStrategy, BACKEND_ACTIVEMQ5, BACKEND_KAFKA, BACKEND_RABBITMQ,
};
use courier_server::error::AppError;
use courier_server::models::retention_expiry;

fn rabbit_config(strategy: RoutingStrategy) -> BrokerConfig {
    BrokerConfig {
        backend: BACKEND_RABBITMQ.to_string(),
        strategy,
        exchange: Some("orders-exchange".to_string()),
        queue: Some("orders".to_string()),
        routing_key: None,
        headers: None,
    }
}

#[test]
fn strategy_support_is_table_driven() {
    // Kafka is topic-only, ActiveMQ 5 speaks direct and topic, RabbitMQ
    // forms all four topologies.
    let table = [
        (BACKEND_RABBITMQ, RoutingStrategy::Headers, true),
        (BACKEND_RABBITMQ, RoutingStrategy::Fanout, true),
        (BACKEND_KAFKA, RoutingStrategy::Topic, true),
        (BACKEND_KAFKA, RoutingStrategy::Direct, false),
        (BACKEND_KAFKA, RoutingStrategy::Headers, false),
        (BACKEND_ACTIVEMQ5, RoutingStrategy::Direct, true),
        (BACKEND_ACTIVEMQ5, RoutingStrategy::Fanout, false),
    ];
    for (backend, strategy, expected) in table {
        assert_eq!(
            broker::validate_strategy(backend, strategy).is_ok(),
            expected,
            "{backend}/{strategy}"
        );
    }
}

#[test]
fn topic_needs_a_routing_key_before_any_topology_exists() {
    let mut config = rabbit_config(RoutingStrategy::Topic);
    let err = config.validate_routing().unwrap_err();
    assert!(matches!(err, AppError::IncompatibleStrategy(_)));

    config.routing_key = Some("orders.#".to_string());
    assert!(config.validate_routing().is_ok());
}

#[test]
fn second_declaration_with_another_strategy_fails() {
    let cache = TopologyCache::new();

    // First declaration wins the type.
    assert!(!cache
        .check(BACKEND_RABBITMQ, "orders-exchange", RoutingStrategy::Direct)
        .unwrap());
    cache.mark(BACKEND_RABBITMQ, "orders-exchange", RoutingStrategy::Direct);

    // Same strategy again: idempotent.
    assert!(cache
        .check(BACKEND_RABBITMQ, "orders-exchange", RoutingStrategy::Direct)
        .unwrap());

    // Different strategy: fatal conflict.
    assert!(matches!(
        cache.check(BACKEND_RABBITMQ, "orders-exchange", RoutingStrategy::Topic),
        Err(AppError::TopologyConflict(_))
    ));
}

#[test]
fn queue_names_are_type_locked_too() {
    let cache = TopologyCache::new();
    cache.mark(BACKEND_RABBITMQ, "orders", RoutingStrategy::Direct);
    assert!(matches!(
        cache.check(BACKEND_RABBITMQ, "orders", RoutingStrategy::Fanout),
        Err(AppError::TopologyConflict(_))
    ));
}

#[test]
fn retention_window_is_stamped_from_receipt_time() {
    let t0 = Utc::now();
    assert_eq!(retention_expiry(t0, 0), None);
    assert_eq!(
        retention_expiry(t0, 30_000),
        Some(t0 + Duration::milliseconds(30_000))
    );
    assert_eq!(
        retention_expiry(t0, i64::MAX),
        Some(DateTime::<Utc>::MAX_UTC)
    );
}

#[test]
fn fanout_sends_without_a_routing_key() {
    let config = rabbit_config(RoutingStrategy::Fanout);
    assert!(config.validate_routing().is_ok());
    assert_eq!(config.resolved_routing_key().unwrap(), "");
}
