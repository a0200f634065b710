//! # Connections API Handlers
//!
//! Listing, detail, manual sync, token refresh and disconnect for Airtable
//! connections. Secret ids never leave the service.

use std::collections::HashMap;

use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

use crate::auth::{AuthenticatedUser, UserHeader};
use crate::error::{ApiError, validation_error};
use crate::handlers::connect::parse_org_id;
use crate::models::{base, connection};
use crate::server::AppState;

#[derive(Debug, Deserialize, IntoParams)]
pub struct ListConnectionsQuery {
    /// Organization whose connections are listed
    pub org_id: Option<String>,
}

/// Connection information for API responses
#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSummary {
    #[schema(value_type = String)]
    pub id: Uuid,
    #[schema(value_type = String)]
    pub organization_id: Uuid,
    pub airtable_user_id: String,
    pub airtable_email: Option<String>,
    /// `pending_sync`, `active`, `error` or `disconnected`
    pub status: String,
    pub error_message: Option<String>,
    pub workspace_count: i32,
    pub base_count: i32,
    pub scopes: Vec<String>,
    pub token_expires_at: Option<String>,
    pub last_sync_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl From<connection::Model> for ConnectionSummary {
    fn from(model: connection::Model) -> Self {
        let scopes = model.scope_list();
        Self {
            id: model.id,
            organization_id: model.organization_id,
            airtable_user_id: model.airtable_user_id,
            airtable_email: model.airtable_email,
            status: model.status,
            error_message: model.error_message,
            workspace_count: model.workspace_count,
            base_count: model.base_count,
            scopes,
            token_expires_at: model.token_expires_at.map(|t| t.to_rfc3339()),
            last_sync_at: model.last_sync_at.map(|t| t.to_rfc3339()),
            created_at: model.created_at.to_rfc3339(),
            updated_at: model.updated_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct LimitsSummary {
    pub current: u64,
    /// Maximum connections; absent when unlimited or unknown
    pub max: Option<u32>,
    pub can_add_more: bool,
    pub plan: Option<String>,
    pub max_bases: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionListResponse {
    pub connections: Vec<ConnectionSummary>,
    pub limits: LimitsSummary,
    #[schema(value_type = String)]
    pub user_role: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct BaseView {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub airtable_base_id: String,
    pub name: String,
    pub permission_level: Option<String>,
}

impl From<base::Model> for BaseView {
    fn from(model: base::Model) -> Self {
        Self {
            id: model.id,
            airtable_base_id: model.airtable_base_id,
            name: model.name,
            permission_level: model.permission_level,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceView {
    #[schema(value_type = String)]
    pub id: Uuid,
    pub airtable_workspace_id: String,
    pub name: String,
    pub bases: Vec<BaseView>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionDetailResponse {
    pub connection: ConnectionSummary,
    pub workspaces: Vec<WorkspaceView>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    pub success: bool,
    pub message: String,
    pub workspace_count: usize,
    pub base_count: usize,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub success: bool,
    pub message: String,
    pub expires_at: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct DeleteResponse {
    pub success: bool,
    pub message: String,
}

/// List an organization's connections
#[utoipa::path(
    get,
    path = "/connections",
    security(("bearer_auth" = [])),
    params(ListConnectionsQuery, UserHeader),
    responses(
        (status = 200, description = "Connections and plan limits", body = ConnectionListResponse),
        (status = 400, description = "Missing or invalid org_id", body = ApiError),
        (status = 401, description = "Missing or invalid credentials", body = ApiError),
        (status = 403, description = "Not a member of the organization", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn list_connections(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(query): Query<ListConnectionsQuery>,
) -> Result<Json<ConnectionListResponse>, ApiError> {
    let organization_id = parse_org_id(query.org_id.as_deref())?;
    let overview = state.flow.list_connections(user_id, organization_id).await?;

    let current = overview.connections.len() as u64;
    let limits = match overview.limits {
        Some(limits) => LimitsSummary {
            current,
            max: limits.max_connections,
            can_add_more: limits.can_add_connection(current),
            plan: Some(limits.plan),
            max_bases: limits.max_bases,
        },
        None => LimitsSummary {
            current,
            max: None,
            can_add_more: true,
            plan: None,
            max_bases: None,
        },
    };

    Ok(Json(ConnectionListResponse {
        connections: overview
            .connections
            .into_iter()
            .map(ConnectionSummary::from)
            .collect(),
        limits,
        user_role: overview.role.as_str().to_string(),
    }))
}

/// Get one connection with its workspaces and bases
#[utoipa::path(
    get,
    path = "/connections/{id}",
    security(("bearer_auth" = [])),
    params(
        ("id" = String, Path, description = "Connection id (UUID)"),
        UserHeader
    ),
    responses(
        (status = 200, description = "Connection detail", body = ConnectionDetailResponse),
        (status = 400, description = "Invalid connection id", body = ApiError),
        (status = 401, description = "Missing or invalid credentials", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn get_connection(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<ConnectionDetailResponse>, ApiError> {
    let connection_id = parse_connection_id(&id)?;
    let detail = state.flow.connection_detail(user_id, connection_id).await?;

    let mut grouped: HashMap<Uuid, Vec<BaseView>> = HashMap::new();
    for base in detail.bases {
        grouped
            .entry(base.workspace_id)
            .or_default()
            .push(BaseView::from(base));
    }

    let workspaces = detail
        .workspaces
        .into_iter()
        .map(|workspace| WorkspaceView {
            bases: grouped.remove(&workspace.id).unwrap_or_default(),
            id: workspace.id,
            airtable_workspace_id: workspace.airtable_workspace_id,
            name: workspace.name,
        })
        .collect();

    Ok(Json(ConnectionDetailResponse {
        connection: detail.connection.into(),
        workspaces,
    }))
}

/// Sync workspaces and bases from Airtable
#[utoipa::path(
    post,
    path = "/connections/{id}/sync",
    security(("bearer_auth" = [])),
    params(
        ("id" = String, Path, description = "Connection id (UUID)"),
        UserHeader
    ),
    responses(
        (status = 200, description = "Sync completed", body = SyncResponse),
        (status = 400, description = "Connection is disconnected", body = ApiError),
        (status = 401, description = "Token missing, revoked or not refreshable", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 500, description = "Airtable or internal failure", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn sync_connection(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<SyncResponse>, ApiError> {
    let connection_id = parse_connection_id(&id)?;
    let outcome = state.flow.sync(user_id, connection_id).await?;

    Ok(Json(SyncResponse {
        success: true,
        message: format!(
            "Synced {} workspaces and {} bases",
            outcome.counts.workspace_count, outcome.counts.base_count
        ),
        workspace_count: outcome.counts.workspace_count,
        base_count: outcome.counts.base_count,
    }))
}

/// Refresh the connection's tokens
#[utoipa::path(
    post,
    path = "/connections/{id}/refresh",
    security(("bearer_auth" = [])),
    params(
        ("id" = String, Path, description = "Connection id (UUID)"),
        UserHeader
    ),
    responses(
        (status = 200, description = "Tokens refreshed", body = RefreshResponse),
        (status = 400, description = "No refresh token available", body = ApiError),
        (status = 401, description = "Refresh rejected, reconnect required", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 500, description = "Vault or internal failure", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn refresh_connection(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<RefreshResponse>, ApiError> {
    let connection_id = parse_connection_id(&id)?;
    let outcome = state.flow.refresh(user_id, connection_id).await?;

    Ok(Json(RefreshResponse {
        success: true,
        message: "Token refreshed".to_string(),
        expires_at: outcome.expires_at.map(|t| t.to_rfc3339()),
    }))
}

/// Disconnect and delete a connection
#[utoipa::path(
    delete,
    path = "/connections/{id}",
    security(("bearer_auth" = [])),
    params(
        ("id" = String, Path, description = "Connection id (UUID)"),
        UserHeader
    ),
    responses(
        (status = 200, description = "Connection removed", body = DeleteResponse),
        (status = 403, description = "Only owners or admins may disconnect", body = ApiError),
        (status = 404, description = "Connection not found", body = ApiError),
        (status = 500, description = "Internal server error", body = ApiError)
    ),
    tag = "connections"
)]
pub async fn delete_connection(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path(id): Path<String>,
) -> Result<Json<DeleteResponse>, ApiError> {
    let connection_id = parse_connection_id(&id)?;
    state.flow.disconnect(user_id, connection_id).await?;

    Ok(Json(DeleteResponse {
        success: true,
        message: "Connection removed".to_string(),
    }))
}

fn parse_connection_id(raw: &str) -> Result<Uuid, ApiError> {
    raw.parse::<Uuid>().map_err(|_| {
        validation_error(
            "Invalid connection id",
            Some(serde_json::json!({ "id": "Must be a valid UUID" })),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn summary_hides_secret_ids() {
        let now = Utc::now().into();
        let model = connection::Model {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            airtable_user_id: "usrABC".to_string(),
            airtable_email: Some("ada@example.com".to_string()),
            status: "active".to_string(),
            access_token_secret_id: Some(Uuid::new_v4()),
            refresh_token_secret_id: Some(Uuid::new_v4()),
            token_expires_at: None,
            last_sync_at: Some(now),
            error_message: None,
            workspace_count: 2,
            base_count: 5,
            scopes: Some(serde_json::json!(["schema.bases:read"])),
            created_at: now,
            updated_at: now,
        };

        let json = serde_json::to_value(ConnectionSummary::from(model)).unwrap();

        assert_eq!(json["airtableUserId"], "usrABC");
        assert_eq!(json["baseCount"], 5);
        assert_eq!(json["scopes"], serde_json::json!(["schema.bases:read"]));
        let text = json.to_string();
        assert!(!text.contains("SecretId"));
        assert!(!text.contains("secret_id"));
    }

    #[test]
    fn invalid_connection_id_is_a_validation_error() {
        let err = parse_connection_id("abc").unwrap_err();
        assert_eq!(err.status, axum::http::StatusCode::BAD_REQUEST);
        assert_eq!(err.code.as_ref(), "VALIDATION_FAILED");
    }
}
