//! Connection authentication — session token verification.
//!
//! ARCHITECTURE
//! ============
//! The token is checked once, on the WebSocket upgrade request. A failed
//! check answers HTTP 401 and no socket is ever opened, so no room
//! interaction can happen on partial trust. The resolved `Identity` then
//! rides along with the connection for its whole lifetime.
//!
//! Tokens are HS256 JWTs with claims `{id, name, exp}`.

use std::collections::HashMap;

use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::event::ErrorCode;

/// Authenticated user attached to a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub user_name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("authentication token missing")]
    Missing,
    #[error("authentication token expired")]
    Expired,
    #[error("authentication token invalid: {0}")]
    Invalid(String),
}

impl ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        "AUTH_FAILED"
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub id: String,
    #[serde(default)]
    pub name: String,
    pub exp: u64,
}

/// Resolves a bearer token to a user identity.
pub trait TokenResolver: Send + Sync {
    /// # Errors
    ///
    /// Returns `AuthError` if the token is malformed, expired, or wrongly signed.
    fn resolve_token(&self, token: &str) -> Result<Identity, AuthError>;
}

pub struct JwtResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtResolver {
    #[must_use]
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);
        Self { key: DecodingKey::from_secret(secret.as_bytes()), validation }
    }
}

impl TokenResolver for JwtResolver {
    fn resolve_token(&self, token: &str) -> Result<Identity, AuthError> {
        if token.is_empty() {
            return Err(AuthError::Missing);
        }
        let data = jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::Expired,
            _ => AuthError::Invalid(e.to_string()),
        })?;

        let claims = data.claims;
        if claims.id.trim().is_empty() {
            return Err(AuthError::Invalid("empty subject".into()));
        }
        // Fall back to the id so presence events always have something to show.
        let user_name = if claims.name.trim().is_empty() { claims.id.clone() } else { claims.name };
        Ok(Identity { user_id: claims.id, user_name })
    }
}

/// Pull the token from `?token=` or an `Authorization: Bearer` header.
#[must_use]
pub fn extract_token(params: &HashMap<String, String>, headers: &HeaderMap) -> Option<String> {
    if let Some(token) = params.get("token").filter(|t| !t.is_empty()) {
        return Some(token.clone());
    }
    let header = headers.get(AUTHORIZATION)?.to_str().ok()?;
    let token = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))?
        .trim();
    (!token.is_empty()).then(|| token.to_string())
}

/// Sign a token for test connections.
#[cfg(test)]
pub(crate) fn sign_token(secret: &str, user_id: &str, user_name: &str, exp: u64) -> String {
    let claims = Claims { id: user_id.into(), name: user_name.into(), exp };
    jsonwebtoken::encode(
        &jsonwebtoken::Header::new(Algorithm::HS256),
        &claims,
        &jsonwebtoken::EncodingKey::from_secret(secret.as_bytes()),
    )
    .expect("signing with an HMAC key cannot fail")
}

#[cfg(test)]
pub(crate) fn far_future() -> u64 {
    u64::try_from(crate::event::now_ms() / 1000).unwrap_or(0) + 3600
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
