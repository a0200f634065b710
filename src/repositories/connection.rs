//! Connection repository for database operations
//!
//! Organization-scoped access to `airtable_connections`. Partial updates go
//! through [`ConnectionPatch`] so the same write can run on the pool or inside
//! a sync transaction.

use anyhow::{Result, anyhow};
use chrono::{DateTime, Utc};
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait,
    PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::connection_state::ConnectionStatus;
use crate::models::connection::{self, Entity as Connection};

/// Fields written when a connection is first created by the OAuth callback.
#[derive(Debug, Clone)]
pub struct NewConnection {
    pub organization_id: Uuid,
    pub user_id: Uuid,
    pub airtable_user_id: String,
    pub airtable_email: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

/// Partial update of a connection row. `None` leaves a column untouched; the
/// nested options set a nullable column to NULL.
#[derive(Debug, Clone, Default)]
pub struct ConnectionPatch {
    pub user_id: Option<Uuid>,
    pub airtable_email: Option<Option<String>>,
    pub status: Option<ConnectionStatus>,
    pub error_message: Option<Option<String>>,
    pub access_token_secret_id: Option<Option<Uuid>>,
    pub refresh_token_secret_id: Option<Option<Uuid>>,
    pub token_expires_at: Option<Option<DateTime<Utc>>>,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub workspace_count: Option<i32>,
    pub base_count: Option<i32>,
    pub scopes: Option<Vec<String>>,
}

impl ConnectionPatch {
    /// Status change plus the error message that goes with it.
    pub fn status(status: ConnectionStatus, error_message: Option<&str>) -> Self {
        Self {
            status: Some(status),
            error_message: Some(error_message.map(str::to_string)),
            ..Default::default()
        }
    }
}

/// Apply a patch on any connection (pool or transaction), bumping `updated_at`.
pub async fn apply_patch<C: ConnectionTrait>(
    db: &C,
    id: Uuid,
    patch: ConnectionPatch,
) -> Result<connection::Model> {
    let existing = Connection::find_by_id(id)
        .one(db)
        .await?
        .ok_or_else(|| anyhow!("Connection '{}' not found", id))?;

    let mut model: connection::ActiveModel = existing.into();

    if let Some(user_id) = patch.user_id {
        model.user_id = Set(user_id);
    }
    if let Some(email) = patch.airtable_email {
        model.airtable_email = Set(email);
    }
    if let Some(status) = patch.status {
        model.status = Set(status.as_str().to_string());
    }
    if let Some(error_message) = patch.error_message {
        model.error_message = Set(error_message);
    }
    if let Some(secret_id) = patch.access_token_secret_id {
        model.access_token_secret_id = Set(secret_id);
    }
    if let Some(secret_id) = patch.refresh_token_secret_id {
        model.refresh_token_secret_id = Set(secret_id);
    }
    if let Some(expires_at) = patch.token_expires_at {
        model.token_expires_at = Set(expires_at.map(DateTimeWithTimeZone::from));
    }
    if let Some(last_sync_at) = patch.last_sync_at {
        model.last_sync_at = Set(Some(last_sync_at.into()));
    }
    if let Some(count) = patch.workspace_count {
        model.workspace_count = Set(count);
    }
    if let Some(count) = patch.base_count {
        model.base_count = Set(count);
    }
    if let Some(scopes) = patch.scopes {
        model.scopes = Set(Some(serde_json::json!(scopes)));
    }
    model.updated_at = Set(Utc::now().into());

    Ok(model.update(db).await?)
}

/// Repository for connection database operations
#[derive(Debug, Clone)]
pub struct ConnectionRepository {
    /// Database connection pool
    pub db: Arc<DatabaseConnection>,
}

impl ConnectionRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<connection::Model>> {
        Ok(Connection::find_by_id(id).one(&*self.db).await?)
    }

    /// Finds the connection for an Airtable account inside one organization.
    pub async fn find_by_org_and_airtable_user(
        &self,
        organization_id: Uuid,
        airtable_user_id: &str,
    ) -> Result<Option<connection::Model>> {
        let found = Connection::find()
            .filter(connection::Column::OrganizationId.eq(organization_id))
            .filter(connection::Column::AirtableUserId.eq(airtable_user_id))
            .one(&*self.db)
            .await?;
        Ok(found)
    }

    /// Inserts a connection in the initial status with no secrets yet.
    ///
    /// A second insert for the same (organization, Airtable account) fails
    /// with the database's unique violation wrapped in the returned error.
    pub async fn create(&self, new: NewConnection) -> Result<connection::Model> {
        let id = Uuid::new_v4();
        let now: DateTimeWithTimeZone = Utc::now().into();

        let active = connection::ActiveModel {
            id: Set(id),
            organization_id: Set(new.organization_id),
            user_id: Set(new.user_id),
            airtable_user_id: Set(new.airtable_user_id),
            airtable_email: Set(new.airtable_email),
            status: Set(ConnectionStatus::initial().as_str().to_string()),
            access_token_secret_id: Set(None),
            refresh_token_secret_id: Set(None),
            token_expires_at: Set(new.token_expires_at.map(DateTimeWithTimeZone::from)),
            last_sync_at: Set(None),
            error_message: Set(None),
            workspace_count: Set(0),
            base_count: Set(0),
            scopes: Set(Some(serde_json::json!(new.scopes))),
            created_at: Set(now),
            updated_at: Set(now),
        };

        Connection::insert(active)
            .exec_without_returning(&*self.db)
            .await?;

        // For SQLite, query the record directly since we already know the ID
        let fetched = Connection::find_by_id(id).one(&*self.db).await?;
        fetched.ok_or_else(|| anyhow!("connection not persisted"))
    }

    pub async fn update(&self, id: Uuid, patch: ConnectionPatch) -> Result<connection::Model> {
        apply_patch(&*self.db, id, patch).await
    }

    /// Deletes a connection; workspaces and bases go with it through the
    /// foreign-key cascade. Returns false when nothing was deleted.
    pub async fn delete(&self, id: Uuid) -> Result<bool> {
        let result = Connection::delete_by_id(id).exec(&*self.db).await?;
        Ok(result.rows_affected > 0)
    }

    /// Connections of an organization, newest first.
    pub async fn list_by_org(&self, organization_id: Uuid) -> Result<Vec<connection::Model>> {
        let connections = Connection::find()
            .filter(connection::Column::OrganizationId.eq(organization_id))
            .order_by_desc(connection::Column::CreatedAt)
            .order_by_asc(connection::Column::Id)
            .all(&*self.db)
            .await?;
        Ok(connections)
    }

    pub async fn count_by_org(&self, organization_id: Uuid) -> Result<u64> {
        let count = Connection::find()
            .filter(connection::Column::OrganizationId.eq(organization_id))
            .count(&*self.db)
            .await?;
        Ok(count)
    }
}

/// True when an error from this repository wraps a unique-index violation.
pub fn is_duplicate_connection(error: &anyhow::Error) -> bool {
    error
        .downcast_ref::<sea_orm::DbErr>()
        .is_some_and(crate::error::is_unique_violation)
}
