use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, StatusCode},
    Json,
};
use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
};

use crate::app_state::AppState;

#[derive(Debug, Clone)]
pub(crate) struct AuthConfig {
    pub(crate) secret: String,
    pub(crate) ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    name: String,
    iat: i64,
    exp: i64,
}

/// Caller identity proven by a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct AuthUser {
    pub(crate) user_id: UserId,
    pub(crate) username: String,
}

impl AuthConfig {
    pub(crate) fn issue(
        &self,
        user_id: UserId,
        username: &str,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.0.to_string(),
            name: username.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.ttl_seconds)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
    }

    pub(crate) fn verify(&self, token: &str) -> Result<AuthUser, jsonwebtoken::errors::Error> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )?;
        let user_id = data
            .claims
            .sub
            .parse::<i64>()
            .map_err(|_| jsonwebtoken::errors::Error::from(ErrorKind::InvalidSubject))?;
        Ok(AuthUser {
            user_id: UserId(user_id),
            username: data.claims.name,
        })
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = (StatusCode, Json<ApiError>);

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or_else(|| unauthorized("missing bearer token"))?;
        state
            .auth
            .verify(token.trim())
            .map_err(|err| unauthorized(&format!("invalid bearer token: {err}")))
    }
}

fn unauthorized(message: &str) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::UNAUTHORIZED,
        Json(ApiError::new(ErrorCode::Unauthorized, message)),
    )
}

#[cfg(test)]
#[path = "tests/auth_tests.rs"]
mod tests;
