use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;

/// Raw bearer token from the Authorization header. Verification happens in
/// the services against the resource's stored project id, so the extractor
/// only requires the header to be present.
#[derive(Debug, Clone)]
pub struct ProjectToken(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for ProjectToken
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .map(|token| ProjectToken(token.to_string()))
            .ok_or_else(|| AppError::unauthorized("Missing Authorization header"))
    }
}
