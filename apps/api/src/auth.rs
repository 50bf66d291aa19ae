//! Session lookup for authenticated endpoints.
//!
//! Sessions are issued elsewhere; this service only reads the `session` and
//! `"user"` tables to find out who is calling and with which role.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts, HeaderMap},
};
use tracing::warn;

use crate::access::policy::Role;
use crate::errors::AppError;
use crate::state::AppState;

const SESSION_COOKIE: &str = "better-auth.session_token";
const SECURE_SESSION_COOKIE: &str = "__Secure-better-auth.session_token";

/// The authenticated user behind a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionUser {
    pub user_id: String,
    pub role: Role,
}

#[async_trait]
impl FromRequestParts<AppState> for SessionUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers).ok_or(AppError::Unauthorized)?;

        let row: Option<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT u.id, u.role
            FROM session s
            JOIN "user" u ON u.id = s.user_id
            WHERE s.token = $1 AND s.expires_at > NOW()
            "#,
        )
        .bind(&token)
        .fetch_optional(&state.db)
        .await?;

        let (user_id, role) = row.ok_or(AppError::Unauthorized)?;
        let role = role.unwrap_or_default().parse::<Role>().map_err(|e| {
            warn!(user_id = %user_id, "Session user has no usable role: {e}");
            AppError::Forbidden
        })?;

        Ok(SessionUser { user_id, role })
    }
}

/// Reads the session token from `Authorization: Bearer` or the session cookie.
/// Signed cookie values carry `<token>.<signature>`; only the token is kept.
fn session_token(headers: &HeaderMap) -> Option<String> {
    if let Some(bearer) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
    {
        return Some(bearer.to_string());
    }

    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE || *name == SECURE_SESSION_COOKIE)
        .and_then(|(_, value)| value.split('.').next())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
}
