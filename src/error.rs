use axum::{http::StatusCode, response::IntoResponse};
use thiserror::Error;

use crate::dto::ApiResponse;

pub type AppResult<T> = Result<T, AppError>;

/// Application error type covering the whole request path.
///
/// Every variant maps to an HTTP status and an application code carried in
/// the response envelope, so clients can branch without parsing messages.
#[derive(Error, Debug)]
pub enum AppError {
    // ===== Authorization =====
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    // ===== Not found =====
    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    // ===== Registration conflicts =====
    #[error("Conflict: {0}")]
    Conflict(String),

    // ===== Broker configuration =====
    #[error("Broker not supported: {0}")]
    BrokerNotSupported(String),

    #[error("Incompatible strategy: {0}")]
    IncompatibleStrategy(String),

    /// A topology name was redeclared with a different type. Fatal
    /// configuration conflict, never retryable.
    #[error("Topology conflict: {0}")]
    TopologyConflict(String),

    // ===== Input validation =====
    #[error("Validation failed: {0}")]
    Validation(String),

    // ===== Broker I/O =====
    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Broker error: {0}")]
    Broker(String),

    // ===== Storage =====
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ===== Everything else =====
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Unexpected error: {0}")]
    Unknown(#[from] anyhow::Error),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::ProducerNotFound(_)
            | AppError::ConsumerNotFound(_)
            | AppError::MessageNotFound(_) => StatusCode::NOT_FOUND,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::BrokerNotSupported(_)
            | AppError::IncompatibleStrategy(_)
            | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Application status code carried in the response envelope.
    pub fn app_code(&self) -> i32 {
        match self {
            AppError::Unauthorized(_) => 1402,
            AppError::ProducerNotFound(_) | AppError::ConsumerNotFound(_) => 1404,
            AppError::MessageNotFound(_) => 1407,
            AppError::Conflict(_) => 1410,
            AppError::BrokerNotSupported(_) => 1415,
            AppError::IncompatibleStrategy(_) => 1416,
            AppError::Validation(_) => 1400,
            AppError::SendFailed(_) => 1501,
            AppError::TopologyConflict(_) => 1502,
            _ => 1500,
        }
    }

    /// Message returned to the client. Server-side failures keep their
    /// detail in the logs only.
    pub fn user_message(&self) -> String {
        match self {
            AppError::Database(_) | AppError::Redis(_) => "Storage error".to_string(),
            AppError::Json(_) | AppError::Internal(_) | AppError::Unknown(_) => {
                "An unexpected error occurred".to_string()
            }
            AppError::Broker(_) => "Broker error".to_string(),
            AppError::SendFailed(_) => "Failed to send message to broker".to_string(),
            other => other.to_string(),
        }
    }

    pub fn log(&self) {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(error = %self, app_code = self.app_code(), "Server error");
        } else if status == StatusCode::UNAUTHORIZED {
            tracing::warn!(error = %self, "Authorization rejected");
        } else {
            tracing::debug!(error = %self, app_code = self.app_code(), "Client error");
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        AppError::Unauthorized(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }
}

impl From<lapin::Error> for AppError {
    fn from(err: lapin::Error) -> Self {
        AppError::Broker(err.to_string())
    }
}

impl From<rdkafka::error::KafkaError> for AppError {
    fn from(err: rdkafka::error::KafkaError) -> Self {
        AppError::Broker(err.to_string())
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        self.log();

        let status = self.status_code();
        let body = ApiResponse::<()>::error(self.user_message(), self.app_code());
        (status, axum::Json(body)).into_response()
    }
}
