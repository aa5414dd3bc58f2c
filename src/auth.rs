use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};

const BEARER_PREFIX: &str = "Bearer ";

/// Claims of a project token issued by the registration service.
///
/// `project_id` is the tenant identity every ownership check compares
/// against; it is optional in the struct so a token without the claim is
/// rejected explicitly instead of failing to deserialize.
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    #[serde(rename = "projectId", default)]
    pub project_id: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Verifies project tokens and enforces resource ownership.
pub struct AuthManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl AuthManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Issue a project token. The registration service is the normal
    /// issuer; this exists for tooling and tests that need a valid token
    /// against the same secret.
    pub fn create_project_token(
        &self,
        user_id: &str,
        project_id: &str,
        ttl: Duration,
    ) -> AppResult<String> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.to_string(),
            project_id: Some(project_id.to_string()),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::internal(format!("Failed to encode token: {}", e)))
    }

    /// Decode and verify a bearer token, stripping the `Bearer ` prefix if
    /// present. Expired or tampered tokens are rejected here.
    pub fn verify(&self, bearer: &str) -> AppResult<Claims> {
        let token = bearer.strip_prefix(BEARER_PREFIX).unwrap_or(bearer).trim();
        if token.is_empty() {
            return Err(AppError::unauthorized("Missing project token"));
        }

        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| {
                tracing::debug!(error = %e, "Token verification failed");
                AppError::unauthorized("Project token is invalid or expired")
            })
    }

    /// Ownership guard: the token's project claim must match the project
    /// that owns the resource. Callers pass the *stored* project id, never
    /// a client-supplied one.
    pub fn authorize(&self, resource_project_id: &str, bearer: &str) -> AppResult<Claims> {
        let claims = self.verify(bearer)?;
        match claims.project_id.as_deref() {
            None => Err(AppError::unauthorized(
                "Project token is missing the project claim",
            )),
            Some(project_id) if project_id != resource_project_id => Err(
                AppError::unauthorized("Token does not match the owning project"),
            ),
            Some(_) => Ok(claims),
        }
    }

    /// Extract the project claim without binding to a resource, used at
    /// registration time when the resource does not exist yet.
    pub fn project_id(&self, bearer: &str) -> AppResult<String> {
        self.verify(bearer)?.project_id.ok_or_else(|| {
            AppError::unauthorized("Project token is missing the project claim")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> AuthManager {
        AuthManager::new("test-secret-with-plenty-of-entropy")
    }

    #[test]
    fn token_round_trip() {
        let auth = manager();
        let token = auth
            .create_project_token("user-1", "project-1", Duration::hours(1))
            .unwrap();
        let claims = auth.verify(&token).unwrap();
        assert_eq!(claims.project_id.as_deref(), Some("project-1"));
        assert_eq!(claims.sub, "user-1");
    }

    #[test]
    fn bearer_prefix_is_stripped() {
        let auth = manager();
        let token = auth
            .create_project_token("user-1", "project-1", Duration::hours(1))
            .unwrap();
        assert!(auth.verify(&format!("Bearer {}", token)).is_ok());
    }

    #[test]
    fn ownership_mismatch_is_unauthorized() {
        let auth = manager();
        let token = auth
            .create_project_token("user-1", "project-2", Duration::hours(1))
            .unwrap();
        let err = auth.authorize("project-1", &token).unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));
        assert!(auth.authorize("project-2", &token).is_ok());
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = manager();
        let token = auth
            .create_project_token("user-1", "project-1", Duration::hours(-2))
            .unwrap();
        assert!(matches!(
            auth.verify(&token),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn foreign_secret_is_rejected() {
        let token = manager()
            .create_project_token("user-1", "project-1", Duration::hours(1))
            .unwrap();
        let other = AuthManager::new("a-different-secret-entirely");
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn missing_project_claim_is_rejected() {
        #[derive(Serialize)]
        struct BareClaims {
            sub: String,
            iat: i64,
            exp: i64,
        }
        let secret = "test-secret-with-plenty-of-entropy";
        let now = Utc::now();
        let token = encode(
            &Header::new(Algorithm::HS256),
            &BareClaims {
                sub: "user-1".to_string(),
                iat: now.timestamp(),
                exp: (now + Duration::hours(1)).timestamp(),
            },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let auth = AuthManager::new(secret);
        assert!(matches!(
            auth.authorize("project-1", &token),
            Err(AppError::Unauthorized(_))
        ));
    }
}
