//! Consumer orchestration: registration, the connect/disconnect lifecycle
//! (listener + push session + side events), retained-message access, and
//! routing-field updates with detach-then-reattach semantics.

use chrono::Utc;
use futures_util::FutureExt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use uuid::Uuid;

use crate::broker::{self, BrokerConfig, DeliveryHandler, RoutingStrategy};
use crate::context::AppContext;
use crate::db;
use crate::dto::{
    headers_to_json, BrokerUpdate, ConsumerDto, MessageDto, PersistenceUpdate, QueueUpdate,
    RegisterConsumerRequest, StrategyUpdate,
};
use crate::error::{AppError, AppResult};
use crate::events::ConnectionEventType;
use crate::metrics;
use crate::models::{Consumer, RetainedMessage};
use crate::session::SessionGuard;

pub async fn register(
    ctx: &AppContext,
    req: RegisterConsumerRequest,
    token: &str,
) -> AppResult<ConsumerDto> {
    req.validate()?;
    let project_id = ctx.auth.project_id(token)?;

    if db::consumer_username_exists(&ctx.db_pool, &req.username).await? {
        return Err(AppError::Conflict(format!(
            "Consumer with username '{}' already registered",
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
    let consumer = Consumer {
        id: Uuid::new_v4().to_string(),
        username: req.username,
        password_hash,
        project_id,
        persistence_time_ms: req.persistence_time,
        broker: backend,
        strategy: strategy.as_str().to_string(),
        exchange: req.exchange,
        queue: req.queue,
        routing_key: req.routing_key,
        headers: headers_to_json(&req.headers),
        created_at: now,
        updated_at: now,
    };

    // An unattachable routing configuration is rejected here, before any
    // topology exists for it.
    BrokerConfig::from_consumer(&consumer)?.validate_routing()?;

    let saved = db::create_consumer(&ctx.db_pool, &consumer).await?;
    tracing::info!(consumer_id = %saved.id, project_id = %saved.project_id, "Consumer registered");
    Ok(ConsumerDto::from_model(saved))
}

pub async fn get(ctx: &AppContext, consumer_id: &str, token: &str) -> AppResult<ConsumerDto> {
    let consumer = find_and_authorize(ctx, consumer_id, token).await?;
    Ok(ConsumerDto::from_model(consumer))
}

pub async fn delete(ctx: &AppContext, consumer_id: &str, token: &str) -> AppResult<()> {
    let consumer = find_and_authorize(ctx, consumer_id, token).await?;

    if let Ok(transport) = ctx.brokers.consumer(&consumer.broker) {
        transport.close(&consumer.id).await;
    }
    let session_closed = ctx.sessions.close(&consumer.id).await;
    ctx.store.delete_all(&consumer.id).await?;
    db::delete_consumer(&ctx.db_pool, &consumer.id).await?;

    // The session close already raised the disconnect; announce it here
    // only when no channel was open.
    if !session_closed {
        ctx.events
            .publish(
                &consumer.id,
                &consumer.project_id,
                ConnectionEventType::Disconnected,
            )
            .await;
    }
    tracing::info!(consumer_id = %consumer.id, "Consumer deleted");
    Ok(())
}

/// Open the long-lived push session and attach the backend listener.
/// Returns the message stream plus the guard that ties channel-lifecycle
/// cleanup to the stream's fate.
pub async fn connect(
    ctx: &AppContext,
    consumer_id: &str,
    token: &str,
) -> AppResult<(UnboundedReceiver<RetainedMessage>, SessionGuard)> {
    let consumer = find_and_authorize(ctx, consumer_id, token).await?;

    attach_listener(ctx, &consumer).await?;
    let (rx, guard) = ctx.sessions.open(&consumer.id, &consumer.project_id);

    ctx.events
        .publish(
            &consumer.id,
            &consumer.project_id,
            ConnectionEventType::Connected,
        )
        .await;
    Ok((rx, guard))
}

/// Explicit disconnect: stop the listener, then remove the push channel.
/// Synchronous from the caller's view; when this returns both are gone.
pub async fn disconnect(ctx: &AppContext, consumer_id: &str, token: &str) -> AppResult<()> {
    let consumer = find_and_authorize(ctx, consumer_id, token).await?;

    ctx.brokers
        .consumer(&consumer.broker)?
        .close(&consumer.id)
        .await;
    let session_closed = ctx.sessions.close(&consumer.id).await;

    if !session_closed {
        ctx.events
            .publish(
                &consumer.id,
                &consumer.project_id,
                ConnectionEventType::Disconnected,
            )
            .await;
    }
    tracing::info!(consumer_id = %consumer.id, "Consumer disconnected");
    Ok(())
}

pub async fn get_messages(
    ctx: &AppContext,
    consumer_id: &str,
    token: &str,
) -> AppResult<Vec<MessageDto>> {
    let consumer = find_and_authorize(ctx, consumer_id, token).await?;
    let messages = ctx.store.list(&consumer.id).await?;
    Ok(messages.into_iter().map(MessageDto::from_model).collect())
}

pub async fn get_message(
    ctx: &AppContext,
    consumer_id: &str,
    message_id: &str,
    token: &str,
) -> AppResult<MessageDto> {
    let consumer = find_and_authorize(ctx, consumer_id, token).await?;
    let message = ctx.store.get(&consumer.id, message_id).await?;
    Ok(MessageDto::from_model(message))
}

pub async fn delete_message(
    ctx: &AppContext,
    consumer_id: &str,
    message_id: &str,
    token: &str,
) -> AppResult<()> {
    let consumer = find_and_authorize(ctx, consumer_id, token).await?;
    ctx.store.delete(&consumer.id, message_id).await
}

pub async fn set_broker(
    ctx: &AppContext,
    consumer_id: &str,
    update: BrokerUpdate,
    token: &str,
) -> AppResult<ConsumerDto> {
    update.validate()?;
    let consumer = find_and_authorize(ctx, consumer_id, token).await?;

    let backend = update.broker.to_lowercase();
    if !ctx.config.backend_enabled(&backend) {
        return Err(AppError::BrokerNotSupported(format!(
            "Broker '{}' is not globally supported",
            update.broker
        )));
    }
    let strategy = RoutingStrategy::parse(&update.strategy)?;
    broker::validate_strategy(&backend, strategy)?;

    let mut updated = consumer.clone();
    updated.broker = backend;
    updated.strategy = strategy.as_str().to_string();
    updated.exchange = update.exchange;
    updated.queue = update.queue.unwrap_or(consumer.queue.clone());
    updated.routing_key = update.routing_key;
    updated.headers = headers_to_json(&update.headers);

    apply_routing_update(ctx, &consumer, updated).await
}

pub async fn set_strategy(
    ctx: &AppContext,
    consumer_id: &str,
    update: StrategyUpdate,
    token: &str,
) -> AppResult<ConsumerDto> {
    update.validate()?;
    let consumer = find_and_authorize(ctx, consumer_id, token).await?;

    let strategy = RoutingStrategy::parse(&update.strategy)?;
    broker::validate_strategy(&consumer.broker, strategy)?;

    let mut updated = consumer.clone();
    updated.strategy = strategy.as_str().to_string();
    updated.exchange = update.exchange;
    updated.queue = update.queue.unwrap_or(consumer.queue.clone());
    updated.routing_key = update.routing_key;
    updated.headers = headers_to_json(&update.headers);

    apply_routing_update(ctx, &consumer, updated).await
}

pub async fn set_queue(
    ctx: &AppContext,
    consumer_id: &str,
    update: QueueUpdate,
    token: &str,
) -> AppResult<ConsumerDto> {
    update.validate()?;
    let consumer = find_and_authorize(ctx, consumer_id, token).await?;

    let mut updated = consumer.clone();
    updated.queue = update.queue;
    updated.exchange = update.exchange;
    updated.routing_key = update.routing_key;
    updated.headers = headers_to_json(&update.headers);

    apply_routing_update(ctx, &consumer, updated).await
}

/// Retention changes do not touch the listener or the push channel.
pub async fn set_persistence_time(
    ctx: &AppContext,
    consumer_id: &str,
    update: PersistenceUpdate,
    token: &str,
) -> AppResult<ConsumerDto> {
    update.validate()?;
    let consumer = find_and_authorize(ctx, consumer_id, token).await?;
    let saved =
        db::update_consumer_persistence(&ctx.db_pool, &consumer.id, update.persistence_time)
            .await?;
    Ok(ConsumerDto::from_model(saved))
}

// ============================================================================
// Internals
// ============================================================================

async fn find_and_authorize(
    ctx: &AppContext,
    consumer_id: &str,
    token: &str,
) -> AppResult<Consumer> {
    let consumer = db::get_consumer(&ctx.db_pool, consumer_id)
        .await?
        .ok_or_else(|| {
            AppError::ConsumerNotFound(format!("Consumer with id '{}' not found", consumer_id))
        })?;
    ctx.auth.authorize(&consumer.project_id, token)?;
    Ok(consumer)
}

/// Persist new routing fields with detach-then-reattach: the old listener
/// is fully stopped before the new configuration attaches, and the
/// listener is only re-established if one was active. The push channel is
/// left untouched either way.
async fn apply_routing_update(
    ctx: &AppContext,
    previous: &Consumer,
    updated: Consumer,
) -> AppResult<ConsumerDto> {
    BrokerConfig::from_consumer(&updated)?.validate_routing()?;

    let was_attached = match ctx.brokers.consumer(&previous.broker) {
        Ok(transport) => transport.close(&previous.id).await,
        Err(_) => false,
    };

    let saved = db::update_consumer_routing(&ctx.db_pool, &updated).await?;

    if was_attached {
        attach_listener(ctx, &saved).await?;
        ctx.events
            .publish(
                &saved.id,
                &saved.project_id,
                ConnectionEventType::Connected,
            )
            .await;
    }

    Ok(ConsumerDto::from_model(saved))
}

pub(crate) async fn attach_listener(ctx: &AppContext, consumer: &Consumer) -> AppResult<()> {
    let transport = ctx.brokers.consumer(&consumer.broker)?;
    let handler = delivery_handler(ctx);
    transport.connect_and_listen(consumer, handler).await
}

/// Per-delivery pipeline: persist first when the message carries an
/// expiry, so it survives a failed or absent push, then best-effort push
/// to the live session.
fn delivery_handler(ctx: &AppContext) -> DeliveryHandler {
    let store = Arc::clone(&ctx.store);
    let sessions = Arc::clone(&ctx.sessions);
    Arc::new(move |message: RetainedMessage| {
        let store = Arc::clone(&store);
        let sessions = Arc::clone(&sessions);
        async move {
            if message.expire_at.is_some() {
                match store.persist(&message).await {
                    Ok(()) => metrics::MESSAGES_RETAINED_TOTAL.inc(),
                    Err(e) => {
                        tracing::error!(
                            consumer_id = %message.consumer_id,
                            message_id = %message.message_id,
                            error = %e,
                            "Failed to persist retained message"
                        );
                    }
                }
            }
            sessions.push(&message).await;
        }
        .boxed()
    })
}
