use anyhow::Result;
use lapin::{Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub mod auth;
pub mod broker;
pub mod config;
pub mod context;
pub mod db;
pub mod dto;
pub mod error;
pub mod events;
pub mod metrics;
pub mod models;
pub mod routes;
pub mod service;
pub mod session;
pub mod store;

use auth::AuthManager;
use broker::kafka::{KafkaListener, KafkaProducer};
use broker::rabbitmq::{RabbitMqConsumer, RabbitMqProducer};
use broker::topology::TopologyCache;
use broker::{BrokerRegistry, BACKEND_KAFKA, BACKEND_RABBITMQ};
use config::Config;
use context::AppContext;
use events::ConnectionEventPublisher;
use session::SessionManager;
use store::MessageStore;

pub async fn run() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env()?);

    // Postgres holds producer/consumer registrations
    let db_pool = Arc::new(db::create_pool(&config.database_url).await?);
    tracing::info!("Connected to database");

    tracing::info!("Applying database migrations...");
    sqlx::migrate!().run(&*db_pool).await?;

    // Redis holds retained message payloads
    let store = Arc::new(MessageStore::connect(&config.redis_url).await?);
    tracing::info!("Connected to Redis");

    // One AMQP connection shared by the transports and the event publisher;
    // lapin multiplexes channels over it.
    let amqp = Arc::new(Connection::connect(&config.amqp_url, ConnectionProperties::default()).await?);
    tracing::info!("Connected to RabbitMQ");

    let topology = Arc::new(TopologyCache::new());
    let mut registry = BrokerRegistry::new();
    registry.register_producer(
        BACKEND_RABBITMQ,
        Arc::new(RabbitMqProducer::new(Arc::clone(&amqp), Arc::clone(&topology))),
    );
    registry.register_consumer(
        BACKEND_RABBITMQ,
        Arc::new(RabbitMqConsumer::new(Arc::clone(&amqp), Arc::clone(&topology))),
    );
    if config.kafka.enabled {
        registry.register_producer(BACKEND_KAFKA, Arc::new(KafkaProducer::new(&config.kafka)?));
        registry.register_consumer(BACKEND_KAFKA, Arc::new(KafkaListener::new(&config.kafka)));
        tracing::info!(brokers = %config.kafka.brokers, "Kafka backend enabled");
    }

    let events = if config.connection_events_enabled {
        Arc::new(ConnectionEventPublisher::new(&amqp, config.replica_addr.clone()).await?)
    } else {
        Arc::new(ConnectionEventPublisher::disabled())
    };

    let sessions = Arc::new(SessionManager::new(Arc::clone(&events)));

    let ctx = Arc::new(AppContext {
        db_pool,
        store,
        auth: Arc::new(AuthManager::new(&config.jwt_secret)),
        brokers: Arc::new(registry),
        sessions,
        events,
        config: Arc::clone(&config),
    });

    let app = routes::create_router(ctx);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("courier-server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
    tracing::info!("Shutdown signal received. Shutting down...");
}
