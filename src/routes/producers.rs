//! Producer ("sender") endpoints. Every handler resolves ownership through
//! the service layer before touching state.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use std::sync::Arc;

use super::extractors::ProjectToken;
use crate::context::AppContext;
use crate::dto::{
    ApiResponse, BrokerUpdate, QueueUpdate, RegisterProducerRequest, SendMessageRequest,
    StrategyUpdate,
};
use crate::error::AppError;
use crate::service::producer;

pub async fn register_producer(
    State(ctx): State<Arc<AppContext>>,
    ProjectToken(token): ProjectToken,
    Json(req): Json<RegisterProducerRequest>,
) -> Result<impl IntoResponse, AppError> {
    let dto = producer::register(&ctx, req, &token).await?;
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::created("Producer registered.", dto)),
    ))
}

pub async fn get_producer(
    State(ctx): State<Arc<AppContext>>,
    Path(producer_id): Path<String>,
    ProjectToken(token): ProjectToken,
) -> Result<impl IntoResponse, AppError> {
    let dto = producer::get(&ctx, &producer_id, &token).await?;
    Ok(Json(ApiResponse::ok("Producer info retrieved.", dto)))
}

pub async fn delete_producer(
    State(ctx): State<Arc<AppContext>>,
    Path(producer_id): Path<String>,
    ProjectToken(token): ProjectToken,
) -> Result<impl IntoResponse, AppError> {
    producer::delete(&ctx, &producer_id, &token).await?;
    Ok(Json(ApiResponse::<()>::new("Producer deleted.", 200, None)))
}

pub async fn connect_producer(
    State(ctx): State<Arc<AppContext>>,
    Path(producer_id): Path<String>,
    ProjectToken(token): ProjectToken,
) -> Result<impl IntoResponse, AppError> {
    producer::connect(&ctx, &producer_id, &token).await?;
    Ok(Json(ApiResponse::<()>::new("Producer connected.", 200, None)))
}

pub async fn send_message(
    State(ctx): State<Arc<AppContext>>,
    Path(producer_id): Path<String>,
    ProjectToken(token): ProjectToken,
    Json(req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, AppError> {
    let message_id = producer::send(&ctx, &producer_id, req, &token).await?;
    Ok(Json(ApiResponse::ok(
        "Message successfully sent.",
        serde_json::json!({ "messageId": message_id }),
    )))
}

pub async fn disconnect_producer(
    State(ctx): State<Arc<AppContext>>,
    Path(producer_id): Path<String>,
    ProjectToken(token): ProjectToken,
) -> Result<impl IntoResponse, AppError> {
    producer::disconnect(&ctx, &producer_id, &token).await?;
    Ok(Json(ApiResponse::<()>::new(
        "Producer disconnected.",
        200,
        None,
    )))
}

pub async fn set_broker(
    State(ctx): State<Arc<AppContext>>,
    Path(producer_id): Path<String>,
    ProjectToken(token): ProjectToken,
    Json(update): Json<BrokerUpdate>,
) -> Result<impl IntoResponse, AppError> {
    let dto = producer::set_broker(&ctx, &producer_id, update, &token).await?;
    Ok(Json(ApiResponse::ok(
        "Producer broker successfully updated.",
        dto,
    )))
}

pub async fn set_strategy(
    State(ctx): State<Arc<AppContext>>,
    Path(producer_id): Path<String>,
    ProjectToken(token): ProjectToken,
    Json(update): Json<StrategyUpdate>,
) -> Result<impl IntoResponse, AppError> {
    let dto = producer::set_strategy(&ctx, &producer_id, update, &token).await?;
    Ok(Json(ApiResponse::ok(
        "Producer strategy successfully updated.",
        dto,
    )))
}

pub async fn set_queue(
    State(ctx): State<Arc<AppContext>>,
    Path(producer_id): Path<String>,
    ProjectToken(token): ProjectToken,
    Json(update): Json<QueueUpdate>,
) -> Result<impl IntoResponse, AppError> {
    let dto = producer::set_queue(&ctx, &producer_id, update, &token).await?;
    Ok(Json(ApiResponse::ok(
        "Producer queue successfully updated.",
        dto,
    )))
}
