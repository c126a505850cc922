use axum::{
    async_trait,
    extract::{FromRef, FromRequestParts},
    http::request::Parts,
};
use tracing::warn;
use uuid::Uuid;

use super::cookies::{read_cookie, ACCESS_COOKIE};
use super::jwt::JwtKeys;
use crate::error::AuthError;

/// Extracts and validates the access token, returning the user ID.
///
/// The token is taken from `Authorization: Bearer <token>` or, failing that,
/// from the `accessToken` cookie.
pub struct AuthUser(pub Uuid);

#[async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
    JwtKeys: FromRef<S>,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let keys = JwtKeys::from_ref(state);

        let bearer = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer ").or_else(|| h.strip_prefix("bearer ")))
            .map(|t| t.trim().to_string());

        let token = bearer
            .filter(|t| !t.is_empty())
            .or_else(|| read_cookie(&parts.headers, ACCESS_COOKIE))
            .ok_or(AuthError::Unauthorized)?;

        let claims = keys.verify_access(&token).map_err(|e| {
            warn!(error = %e, "access token rejected");
            AuthError::InvalidToken
        })?;

        Ok(AuthUser(claims.sub))
    }
}
