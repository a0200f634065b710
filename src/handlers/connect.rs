//! # Connect Handlers
//!
//! Browser-facing OAuth entry points: `/connect` sends the user to Airtable,
//! `/callback` finishes the authorization and sends the user back to the
//! settings page with a `success` or `error` message.

use axum::{
    extract::{Query, State},
    http::{StatusCode, header::LOCATION},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use url::Url;
use utoipa::IntoParams;
use uuid::Uuid;

use crate::auth::{AuthenticatedUser, UserHeader};
use crate::error::{ApiError, internal_error, validation_error};
use crate::oauth_flow::CallbackParams;
use crate::server::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct ConnectQuery {
    /// Organization the new connection will belong to
    pub org_id: Option<String>,
    /// Existing connection being re-authorized; exempt from the plan cap
    pub reconnect: Option<String>,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct CallbackQuery {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
    pub error_description: Option<String>,
}

/// Start the Airtable authorization
#[utoipa::path(
    get,
    path = "/connect",
    security(("bearer_auth" = [])),
    params(ConnectQuery, UserHeader),
    responses(
        (status = 302, description = "Redirect to the Airtable authorization page"),
        (status = 400, description = "Missing or invalid org_id or reconnect", body = ApiError),
        (status = 401, description = "Missing or invalid credentials", body = ApiError),
        (status = 403, description = "Not an owner/admin or plan limit reached", body = ApiError),
        (status = 500, description = "Airtable OAuth not configured", body = ApiError)
    ),
    tag = "connect"
)]
pub async fn connect(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<ConnectQuery>,
) -> Result<Response, ApiError> {
    let organization_id = parse_org_id(query.org_id.as_deref())?;
    let reconnect = parse_reconnect(query.reconnect.as_deref())?;

    let redirect = state
        .flow
        .initiate_connect(user_id, organization_id, reconnect)
        .await?;
    Ok(found(redirect.url.as_str()))
}

/// Complete the Airtable authorization
///
/// Always answers with a redirect to the settings page; failures are reported
/// through its `error` query parameter.
#[utoipa::path(
    get,
    path = "/callback",
    params(CallbackQuery),
    responses(
        (status = 302, description = "Redirect to the settings page with `success` or `error`")
    ),
    tag = "connect"
)]
pub async fn callback(
    State(state): State<AppState>,
    Query(query): Query<CallbackQuery>,
) -> Result<Response, ApiError> {
    let params = CallbackParams {
        code: query.code,
        state: query.state,
        error: query.error,
        error_description: query.error_description,
    };

    let (key, message) = match state.flow.handle_callback(params).await {
        Ok(outcome) => ("success", outcome.user_message().to_string()),
        Err(err) => {
            if err.status().is_server_error() {
                tracing::error!(error = ?err, "Airtable callback failed");
            } else {
                tracing::warn!(error = %err, "Airtable callback rejected");
            }
            ("error", err.user_message())
        }
    };

    let target = settings_redirect(&state.config.settings_url, key, &message)?;
    Ok(found(target.as_str()))
}

pub(crate) fn parse_org_id(raw: Option<&str>) -> Result<Uuid, ApiError> {
    let raw = raw.filter(|value| !value.is_empty()).ok_or_else(|| {
        validation_error(
            "org_id is required",
            Some(serde_json::json!({ "org_id": "Required query parameter is missing" })),
        )
    })?;

    raw.parse::<Uuid>().map_err(|_| {
        validation_error(
            "Invalid org_id",
            Some(serde_json::json!({ "org_id": "Must be a valid UUID" })),
        )
    })
}

fn parse_reconnect(raw: Option<&str>) -> Result<Option<Uuid>, ApiError> {
    match raw.filter(|value| !value.is_empty()) {
        None => Ok(None),
        Some(raw) => raw.parse::<Uuid>().map(Some).map_err(|_| {
            validation_error(
                "Invalid reconnect",
                Some(serde_json::json!({ "reconnect": "Must be a valid connection id" })),
            )
        }),
    }
}

fn settings_redirect(settings_url: &str, key: &str, message: &str) -> Result<Url, ApiError> {
    let mut url = Url::parse(settings_url).map_err(|err| {
        tracing::error!(error = %err, "Configured settings URL is invalid");
        internal_error(None)
    })?;
    url.query_pairs_mut().append_pair(key, message);
    Ok(url)
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(LOCATION, location.to_string())]).into_response()
}
