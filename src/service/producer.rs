//! Producer orchestration: ownership guard, strategy validation, per-send
//! override resolution, and transport selection.

use chrono::Utc;
use uuid::Uuid;

use crate::broker::{self, BrokerConfig, RoutingStrategy};
use crate::context::AppContext;
use crate::db;
use crate::dto::{
    headers_to_json, BrokerUpdate, ProducerDto, QueueUpdate, RegisterProducerRequest,
    SendMessageRequest, StrategyUpdate,
};
use crate::error::{AppError, AppResult};
use crate::models::{MessageEnvelope, Producer};

pub async fn register(
    ctx: &AppContext,
    req: RegisterProducerRequest,
    token: &str,
) -> AppResult<ProducerDto> {
    req.validate()?;
    let project_id = ctx.auth.project_id(token)?;

    if db::producer_username_exists(&ctx.db_pool, &req.username).await? {
        return Err(AppError::Conflict(format!(
            "Producer with username '{}' already registered",
            req.username
        )));
    }

    let backend = req.broker.to_lowercase();
    if !ctx.config.backend_enabled(&backend) {
        return Err(AppError::BrokerNotSupported(format!(
            "Broker '{}' is not globally supported",
            req.broker
        )));
    }
    let strategy = RoutingStrategy::parse(&req.strategy)?;
    broker::validate_strategy(&backend, strategy)?;

    let password_hash = bcrypt::hash(&req.password, bcrypt::DEFAULT_COST)
        .map_err(|e| AppError::internal(format!("Failed to hash credentials: {}", e)))?;

    let now = Utc::now();
    let producer = Producer {
        id: Uuid::new_v4().to_string(),
        username: req.username,
        password_hash,
        project_id,
        broker: backend,
        strategy: strategy.as_str().to_string(),
        exchange: req.exchange,
        queue: req.queue,
        routing_key: req.routing_key,
        headers: headers_to_json(&req.headers),
        created_at: now,
        updated_at: now,
    };

    let saved = db::create_producer(&ctx.db_pool, &producer).await?;
    tracing::info!(producer_id = %saved.id, project_id = %saved.project_id, "Producer registered");
    Ok(ProducerDto::from_model(saved))
}

pub async fn get(ctx: &AppContext, producer_id: &str, token: &str) -> AppResult<ProducerDto> {
    let producer = find_and_authorize(ctx, producer_id, token).await?;
    Ok(ProducerDto::from_model(producer))
}

pub async fn delete(ctx: &AppContext, producer_id: &str, token: &str) -> AppResult<()> {
    let producer = find_and_authorize(ctx, producer_id, token).await?;
    // Best-effort resource release; a backend without a wired transport has
    // nothing to close.
    if let Ok(transport) = ctx.brokers.producer(&producer.broker) {
        transport.close(&producer.id).await;
    }
    db::delete_producer(&ctx.db_pool, &producer.id).await?;
    tracing::info!(producer_id = %producer.id, "Producer deleted");
    Ok(())
}

/// Pre-flight hook: backends that keep pooled connections may allocate
/// here; all of them validate the stored configuration.
pub async fn connect(ctx: &AppContext, producer_id: &str, token: &str) -> AppResult<()> {
    let producer = find_and_authorize(ctx, producer_id, token).await?;
    let config = BrokerConfig::from_producer(&producer)?;
    broker::validate_strategy(&config.backend, config.strategy)?;
    ctx.brokers.producer(&config.backend)?.connect(&config).await
}

pub async fn send(
    ctx: &AppContext,
    producer_id: &str,
    req: SendMessageRequest,
    token: &str,
) -> AppResult<String> {
    req.validate()?;
    let producer = find_and_authorize(ctx, producer_id, token).await?;

    let envelope = MessageEnvelope {
        message_id: Uuid::new_v4().to_string(),
        data: req.data.clone(),
        headers: req.headers.clone().filter(|m| !m.is_empty()),
    };

    let config = resolve_send_config(&producer, &req)?;
    broker::validate_strategy(&config.backend, config.strategy)?;

    let transport = ctx.brokers.producer(&config.backend)?;
    transport.send(&envelope, &config).await?;
    Ok(envelope.message_id)
}

pub async fn disconnect(ctx: &AppContext, producer_id: &str, token: &str) -> AppResult<()> {
    let producer = find_and_authorize(ctx, producer_id, token).await?;
    ctx.brokers
        .producer(&producer.broker)?
        .close(&producer.id)
        .await;
    tracing::info!(producer_id = %producer.id, broker = %producer.broker, "Producer disconnected");
    Ok(())
}

pub async fn set_broker(
    ctx: &AppContext,
    producer_id: &str,
    update: BrokerUpdate,
    token: &str,
) -> AppResult<ProducerDto> {
    update.validate()?;
    let mut producer = find_and_authorize(ctx, producer_id, token).await?;

    let backend = update.broker.to_lowercase();
    if !ctx.config.backend_enabled(&backend) {
        return Err(AppError::BrokerNotSupported(format!(
            "Broker '{}' is not globally supported",
            update.broker
        )));
    }
    let strategy = RoutingStrategy::parse(&update.strategy)?;
    broker::validate_strategy(&backend, strategy)?;

    producer.broker = backend;
    producer.strategy = strategy.as_str().to_string();
    producer.exchange = update.exchange;
    producer.queue = update.queue;
    producer.routing_key = update.routing_key;
    producer.headers = headers_to_json(&update.headers);

    let saved = db::update_producer_routing(&ctx.db_pool, &producer).await?;
    Ok(ProducerDto::from_model(saved))
}

pub async fn set_strategy(
    ctx: &AppContext,
    producer_id: &str,
    update: StrategyUpdate,
    token: &str,
) -> AppResult<ProducerDto> {
    update.validate()?;
    let mut producer = find_and_authorize(ctx, producer_id, token).await?;

    let strategy = RoutingStrategy::parse(&update.strategy)?;
    broker::validate_strategy(&producer.broker, strategy)?;

    producer.strategy = strategy.as_str().to_string();
    producer.exchange = update.exchange;
    producer.queue = update.queue;
    producer.routing_key = update.routing_key;
    producer.headers = headers_to_json(&update.headers);

    let saved = db::update_producer_routing(&ctx.db_pool, &producer).await?;
    Ok(ProducerDto::from_model(saved))
}

pub async fn set_queue(
    ctx: &AppContext,
    producer_id: &str,
    update: QueueUpdate,
    token: &str,
) -> AppResult<ProducerDto> {
    update.validate()?;
    let mut producer = find_and_authorize(ctx, producer_id, token).await?;

    producer.queue = Some(update.queue);
    producer.exchange = update.exchange;
    producer.routing_key = update.routing_key;
    producer.headers = headers_to_json(&update.headers);

    let saved = db::update_producer_routing(&ctx.db_pool, &producer).await?;
    Ok(ProducerDto::from_model(saved))
}

async fn find_and_authorize(
    ctx: &AppContext,
    producer_id: &str,
    token: &str,
) -> AppResult<Producer> {
    let producer = db::get_producer(&ctx.db_pool, producer_id)
        .await?
        .ok_or_else(|| {
            AppError::ProducerNotFound(format!("Producer with id '{}' not found", producer_id))
        })?;
    ctx.auth.authorize(&producer.project_id, token)?;
    Ok(producer)
}

/// Merge the producer's stored routing defaults with the per-send request.
/// A supplied non-empty field wins; an absent or empty field falls back to
/// the stored default.
fn resolve_send_config(producer: &Producer, req: &SendMessageRequest) -> AppResult<BrokerConfig> {
    let strategy_raw = override_field(&Some(producer.strategy.clone()), &req.strategy)
        .unwrap_or_else(|| producer.strategy.clone());

    let headers = match &req.headers {
        Some(map) if !map.is_empty() => Some(serde_json::to_string(map)?),
        _ => producer.headers.clone(),
    };

    Ok(BrokerConfig {
        backend: producer.broker.to_lowercase(),
        strategy: RoutingStrategy::parse(&strategy_raw)?,
        exchange: override_field(&producer.exchange, &req.exchange),
        queue: override_field(&producer.queue, &req.queue),
        routing_key: override_field(&producer.routing_key, &req.routing_key),
        headers,
    })
}

fn override_field(stored: &Option<String>, supplied: &Option<String>) -> Option<String> {
    match supplied.as_deref().map(str::trim) {
        Some(value) if !value.is_empty() => Some(value.to_string()),
        _ => stored.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored_producer() -> Producer {
        let now = Utc::now();
        Producer {
            id: "prod-1".to_string(),
            username: "sensorhub1".to_string(),
            password_hash: "hash".to_string(),
            project_id: "project-1".to_string(),
            broker: "rabbitmq".to_string(),
            strategy: "direct".to_string(),
            exchange: Some("telemetry".to_string()),
            queue: Some("q1".to_string()),
            routing_key: None,
            headers: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn send_request() -> SendMessageRequest {
        SendMessageRequest {
            data: "hello".to_string(),
            strategy: None,
            exchange: None,
            queue: None,
            routing_key: None,
            headers: None,
        }
    }

    #[test]
    fn absent_fields_fall_back_to_stored_defaults() {
        let config = resolve_send_config(&stored_producer(), &send_request()).unwrap();
        assert_eq!(config.strategy, RoutingStrategy::Direct);
        assert_eq!(config.exchange.as_deref(), Some("telemetry"));
        assert_eq!(config.queue.as_deref(), Some("q1"));
    }

    #[test]
    fn supplied_fields_win_over_stored_defaults() {
        let mut req = send_request();
        req.strategy = Some("topic".to_string());
        req.routing_key = Some("orders.eu".to_string());
        req.exchange = Some("other".to_string());

        let config = resolve_send_config(&stored_producer(), &req).unwrap();
        assert_eq!(config.strategy, RoutingStrategy::Topic);
        assert_eq!(config.routing_key.as_deref(), Some("orders.eu"));
        assert_eq!(config.exchange.as_deref(), Some("other"));
    }

    #[test]
    fn empty_string_counts_as_not_supplied() {
        let mut req = send_request();
        req.exchange = Some("".to_string());
        req.queue = Some("   ".to_string());

        let config = resolve_send_config(&stored_producer(), &req).unwrap();
        assert_eq!(config.exchange.as_deref(), Some("telemetry"));
        assert_eq!(config.queue.as_deref(), Some("q1"));
    }

    #[test]
    fn unknown_override_strategy_is_rejected() {
        let mut req = send_request();
        req.strategy = Some("broadcast".to_string());
        assert!(matches!(
            resolve_send_config(&stored_producer(), &req),
            Err(AppError::IncompatibleStrategy(_))
        ));
    }
}
