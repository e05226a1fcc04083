/// Tenant identity extractor
///
/// Authentication happens upstream; the gateway forwards the authenticated tenant
/// in `x-user-id`. Handlers that take an `AuthUser` reject requests without it.

use crate::error::AppError;
use axum::{extract::FromRequestParts, http::request::Parts};

pub const USER_HEADER: &str = "x-user-id";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser(pub String);

impl AuthUser {
    pub fn id(&self) -> &str {
        &self.0
    }
}

impl<S> FromRequestParts<S> for AuthUser
where
    S: Send + Sync,
{
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let user = parts
            .headers
            .get(USER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        match user {
            Some(user) => Ok(Self(user.to_string())),
            None => {
                tracing::warn!("🔒 Rejected {} {}: missing {}", parts.method, parts.uri.path(), USER_HEADER);
                Err(AppError::Unauthorized)
            }
        }
    }
}
