//! Bearer token authentication
//!
//! Tokens are issued by the platform's auth service (HS256, shared secret).
//! The middleware turns a valid token into an [`Actor`] request extension.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode, header},
    middleware::Next,
    response::Response,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};

use crate::branch_transfer::{Actor, Role};

use super::state::AppState;
use super::types::{ApiError, error_codes};

/// JWT Claims structure
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    pub sub: String, // Subject (user_id as string)
    pub role: String,
    pub exp: usize, // Expiration time (as UTC timestamp)
    pub iat: usize, // Issued at
}

impl Claims {
    pub fn actor(&self) -> Option<Actor> {
        let user_id = self.sub.parse().ok()?;
        let role = Role::parse(&self.role)?;
        Some(Actor::new(user_id, role))
    }
}

pub struct JwtVerifier {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Mint a token for `actor`; used by tooling and tests
    pub fn issue(&self, actor: Actor, ttl: Duration) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: actor.user_id.to_string(),
            role: actor.role.as_str().to_string(),
            exp: (now + ttl).timestamp() as usize,
            iat: now.timestamp() as usize,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }

    pub fn verify(&self, token: &str) -> Result<Actor, ApiError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|_| ApiError::unauthorized("Invalid or expired token"))?;
        data.claims
            .actor()
            .ok_or_else(|| ApiError::unauthorized("Token carries an unknown subject or role"))
    }
}

pub async fn jwt_auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    // 1. Extract Authorization header
    let auth_header = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            ApiError::new(
                StatusCode::UNAUTHORIZED,
                error_codes::MISSING_AUTH,
                "Missing Authorization header",
            )
        })?;

    let Some(token) = auth_header.strip_prefix("Bearer ") else {
        return ApiError::unauthorized("Invalid token format").into_err();
    };

    // 2. Verify token and inject the caller
    let actor = state.jwt.verify(token)?;
    tracing::debug!(user_id = actor.user_id, role = %actor.role, "Authenticated");
    request.extensions_mut().insert(actor);

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_issue_and_verify() {
        let jwt = JwtVerifier::new("test-secret");
        let token = jwt.issue(Actor::manager(100), Duration::hours(1)).unwrap();
        assert_eq!(jwt.verify(&token).unwrap(), Actor::manager(100));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = JwtVerifier::new("a")
            .issue(Actor::parent(7), Duration::hours(1))
            .unwrap();
        let err = JwtVerifier::new("b").verify(&token).unwrap_err();
        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert_eq!(err.code, error_codes::AUTH_FAILED);
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = JwtVerifier::new("test-secret");
        let token = jwt.issue(Actor::parent(7), Duration::hours(-2)).unwrap();
        assert!(jwt.verify(&token).is_err());
    }

    #[test]
    fn test_unknown_role_rejected() {
        let claims = Claims {
            sub: "7".to_string(),
            role: "janitor".to_string(),
            exp: 0,
            iat: 0,
        };
        assert!(claims.actor().is_none());

        let claims = Claims {
            sub: "7".to_string(),
            role: "Branch_Manager".to_string(),
            exp: 0,
            iat: 0,
        };
        assert_eq!(claims.actor(), Some(Actor::manager(7)));
    }
}
