// ============================================================================
// Router assembly
// ============================================================================
//
// Producers live under /api/senders, consumers under /api/receivers; both
// require a project bearer token on every route. Health and metrics stay
// unauthenticated.
//
// ============================================================================

mod consumers;
pub mod extractors;
mod health;
mod producers;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::context::AppContext;

pub fn create_router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/metrics", get(health::metrics))
        // Producers
        .route("/api/senders", post(producers::register_producer))
        .route(
            "/api/senders/:producer_id",
            get(producers::get_producer).delete(producers::delete_producer),
        )
        .route(
            "/api/senders/:producer_id/connect",
            post(producers::connect_producer),
        )
        .route(
            "/api/senders/:producer_id/send",
            post(producers::send_message),
        )
        .route(
            "/api/senders/:producer_id/close",
            post(producers::disconnect_producer),
        )
        .route("/api/senders/:producer_id/broker", put(producers::set_broker))
        .route(
            "/api/senders/:producer_id/strategy",
            put(producers::set_strategy),
        )
        .route("/api/senders/:producer_id/queue", put(producers::set_queue))
        // Consumers
        .route("/api/receivers", post(consumers::register_consumer))
        .route(
            "/api/receivers/:consumer_id",
            get(consumers::get_consumer).delete(consumers::delete_consumer),
        )
        .route("/api/receivers/:consumer_id/receive", get(consumers::receive))
        .route(
            "/api/receivers/:consumer_id/close",
            post(consumers::disconnect_consumer),
        )
        .route(
            "/api/receivers/:consumer_id/messages",
            get(consumers::get_messages),
        )
        .route(
            "/api/receivers/:consumer_id/message/:message_id",
            get(consumers::get_message).delete(consumers::delete_message),
        )
        .route(
            "/api/receivers/:consumer_id/broker",
            put(consumers::set_broker),
        )
        .route(
            "/api/receivers/:consumer_id/strategy",
            put(consumers::set_strategy),
        )
        .route("/api/receivers/:consumer_id/queue", put(consumers::set_queue))
        .route(
            "/api/receivers/:consumer_id/persistence",
            put(consumers::set_persistence_time),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(ctx)
}
