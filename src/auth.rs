//! # Authentication
//!
//! Protected routes require an operator bearer token plus the `X-User-Id` of
//! the end user the request acts for. The middleware validates both and
//! stores an [`AuthenticatedUser`] in the request extensions.

use std::sync::Arc;

use axum::{
    extract::{FromRef, FromRequestParts, Request, State},
    http::{HeaderMap, header::AUTHORIZATION, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::{ApiError, unauthorized};
use crate::server::AppState;

pub const USER_ID_HEADER: &str = "x-user-id";

/// The end user a request acts for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthenticatedUser(pub Uuid);

impl FromRef<AppState> for Arc<AppConfig> {
    fn from_ref(app_state: &AppState) -> Self {
        Arc::clone(&app_state.config)
    }
}

/// Validates the operator bearer token and the user header.
pub async fn auth_middleware(
    State(config): State<Arc<AppConfig>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = extract_bearer_token(request.headers())?;
    validate_token(&config, token)?;

    let user = extract_user_id(request.headers())?;
    tracing::debug!(user_id = %user.0, "Authenticated request");

    request.extensions_mut().insert(user);
    Ok(next.run(request).await)
}

fn extract_bearer_token(headers: &HeaderMap) -> Result<&str, ApiError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or_else(|| unauthorized(Some("Missing Authorization header")))?
        .to_str()
        .map_err(|_| unauthorized(Some("Invalid Authorization header")))?;

    header
        .strip_prefix("Bearer ")
        .ok_or_else(|| unauthorized(Some("Authorization header must use Bearer scheme")))
}

fn validate_token(config: &AppConfig, token: &str) -> Result<(), ApiError> {
    let is_valid = config
        .operator_tokens
        .iter()
        .any(|configured| ConstantTimeEq::ct_eq(token.as_bytes(), configured.as_bytes()).into());

    if is_valid {
        Ok(())
    } else {
        Err(unauthorized(Some("Invalid bearer token")))
    }
}

fn extract_user_id(headers: &HeaderMap) -> Result<AuthenticatedUser, ApiError> {
    headers
        .get(USER_ID_HEADER)
        .ok_or_else(|| unauthorized(Some("Missing X-User-Id header")))?
        .to_str()
        .ok()
        .and_then(|value| value.parse::<Uuid>().ok())
        .map(AuthenticatedUser)
        .ok_or_else(|| unauthorized(Some("X-User-Id must be a valid UUID")))
}

/// OpenAPI header parameter for X-User-Id
#[derive(Debug, Serialize, Deserialize, IntoParams, utoipa::ToSchema)]
#[into_params(parameter_in = Header)]
pub struct UserHeader {
    /// Identifier (UUID) of the end user the request acts for
    #[serde(rename = "X-User-Id")]
    #[param(rename = "X-User-Id", value_type = String)]
    pub user_id: String,
}

impl<S> FromRequestParts<S> for AuthenticatedUser
where
    S: Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AuthenticatedUser>()
            .copied()
            .ok_or_else(|| unauthorized(Some("Authentication required")))
    }
}
