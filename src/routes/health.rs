use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use std::sync::Arc;

use crate::context::AppContext;
use crate::error::AppError;

pub async fn health_check(
    State(ctx): State<Arc<AppContext>>,
) -> Result<impl IntoResponse, AppError> {
    sqlx::query("SELECT 1").execute(&*ctx.db_pool).await?;
    ctx.store.ping().await?;
    Ok("OK")
}

pub async fn metrics() -> Result<impl IntoResponse, AppError> {
    let body = crate::metrics::gather_metrics()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}
