//! Consumer ("receiver") endpoints, including the long-lived SSE stream.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use futures_util::Stream;
use std::convert::Infallible;
use std::sync::Arc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;

use super::extractors::ProjectToken;
use crate::context::AppContext;
use crate::dto::{
    ApiResponse, BrokerUpdate, MessageDto, PersistenceUpdate, QueueUpdate,
    RegisterConsumerRequest, StrategyUpdate,
};
use crate::error::AppError;
use crate::service::consumer;

pub async fn register_consumer(
    State(ctx): State<Arc<AppContext>>,
    ProjectToken(token): ProjectToken,
    Json(req): Json<RegisterConsumerRequest>,
) -> Result<impl IntoResponse, AppError> {
    let dto = consumer::register(&ctx, req, &token).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::created("Consumer registered.", dto)),
    ))
}

pub async fn get_consumer(
    State(ctx): State<Arc<AppContext>>,
    Path(consumer_id): Path<String>,
    ProjectToken(token): ProjectToken,
) -> Result<impl IntoResponse, AppError> {
    let dto = consumer::get(&ctx, &consumer_id, &token).await?;
    Ok(Json(ApiResponse::ok("Consumer info retrieved.", dto)))
}

pub async fn delete_consumer(
    State(ctx): State<Arc<AppContext>>,
    Path(consumer_id): Path<String>,
    ProjectToken(token): ProjectToken,
) -> Result<impl IntoResponse, AppError> {
    consumer::delete(&ctx, &consumer_id, &token).await?;
    Ok(Json(ApiResponse::<()>::new("Consumer deleted.", 200, None)))
}

/// The long-lived event stream. Messages arrive as `message` events whose
/// id is the broker message id; the session guard travels inside the
/// stream so that dropping the connection triggers session teardown.
pub async fn receive(
    State(ctx): State<Arc<AppContext>>,
    Path(consumer_id): Path<String>,
    ProjectToken(token): ProjectToken,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let (rx, guard) = consumer::connect(&ctx, &consumer_id, &token).await?;

    let stream = UnboundedReceiverStream::new(rx).map(move |message| {
        let _session = &guard;
        let id = message.message_id.clone();
        let payload =
            serde_json::to_string(&MessageDto::from_model(message)).unwrap_or_default();
        Ok(Event::default().id(id).event("message").data(payload))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

pub async fn disconnect_consumer(
    State(ctx): State<Arc<AppContext>>,
    Path(consumer_id): Path<String>,
    ProjectToken(token): ProjectToken,
) -> Result<impl IntoResponse, AppError> {
    consumer::disconnect(&ctx, &consumer_id, &token).await?;
    Ok(Json(ApiResponse::<()>::new(
        "Consumer disconnected.",
        200,
        None,
    )))
}

pub async fn get_messages(
    State(ctx): State<Arc<AppContext>>,
    Path(consumer_id): Path<String>,
    ProjectToken(token): ProjectToken,
) -> Result<impl IntoResponse, AppError> {
    let messages = consumer::get_messages(&ctx, &consumer_id, &token).await?;
    Ok(Json(ApiResponse::ok(
        "Messages retrieved successfully.",
        messages,
    )))
}

pub async fn get_message(
    State(ctx): State<Arc<AppContext>>,
    Path((consumer_id, message_id)): Path<(String, String)>,
    ProjectToken(token): ProjectToken,
) -> Result<impl IntoResponse, AppError> {
    let message = consumer::get_message(&ctx, &consumer_id, &message_id, &token).await?;
    Ok(Json(ApiResponse::ok(
        "Message retrieved successfully.",
        message,
    )))
}

pub async fn delete_message(
    State(ctx): State<Arc<AppContext>>,
    Path((consumer_id, message_id)): Path<(String, String)>,
    ProjectToken(token): ProjectToken,
) -> Result<impl IntoResponse, AppError> {
    consumer::delete_message(&ctx, &consumer_id, &message_id, &token).await?;
    Ok(Json(ApiResponse::<()>::new(
        "Message deleted successfully.",
        200,
        None,
    )))
}

pub async fn set_broker(
    State(ctx): State<Arc<AppContext>>,
    Path(consumer_id): Path<String>,
    ProjectToken(token): ProjectToken,
    Json(update): Json<BrokerUpdate>,
) -> Result<impl IntoResponse, AppError> {
    let dto = consumer::set_broker(&ctx, &consumer_id, update, &token).await?;
    Ok(Json(ApiResponse::ok("Consumer broker updated.", dto)))
}

pub async fn set_strategy(
    State(ctx): State<Arc<AppContext>>,
    Path(consumer_id): Path<String>,
    ProjectToken(token): ProjectToken,
    Json(update): Json<StrategyUpdate>,
) -> Result<impl IntoResponse, AppError> {
    let dto = consumer::set_strategy(&ctx, &consumer_id, update, &token).await?;
    Ok(Json(ApiResponse::ok("Consumer strategy updated.", dto)))
}

pub async fn set_queue(
    State(ctx): State<Arc<AppContext>>,
    Path(consumer_id): Path<String>,
    ProjectToken(token): ProjectToken,
    Json(update): Json<QueueUpdate>,
) -> Result<impl IntoResponse, AppError> {
    let dto = consumer::set_queue(&ctx, &consumer_id, update, &token).await?;
    Ok(Json(ApiResponse::ok("Consumer queue updated.", dto)))
}

pub async fn set_persistence_time(
    State(ctx): State<Arc<AppContext>>,
    Path(consumer_id): Path<String>,
    ProjectToken(token): ProjectToken,
    Json(update): Json<PersistenceUpdate>,
) -> Result<impl IntoResponse, AppError> {
    let dto = consumer::set_persistence_time(&ctx, &consumer_id, update, &token).await?;
    Ok(Json(ApiResponse::ok(
        "Consumer persistence time updated.",
        dto,
    )))
}
