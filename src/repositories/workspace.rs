//! Workspace and base repository
//!
//! Cached Airtable workspaces and bases per connection. Rows are never edited
//! in place: a sync swaps the whole set with [`replace_for_connection`].

use chrono::Utc;
use sea_orm::prelude::DateTimeWithTimeZone;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, Set,
};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::base::{self, Entity as Base};
use crate::models::workspace::{self, Entity as Workspace};

/// Workspace row about to be written by a sync
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceRecord {
    pub id: Uuid,
    pub airtable_workspace_id: String,
    pub name: String,
}

/// Base row about to be written by a sync, already resolved to its workspace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseRecord {
    pub id: Uuid,
    pub workspace_id: Uuid,
    pub airtable_base_id: String,
    pub name: String,
    pub permission_level: Option<String>,
}

/// Delete every base then every workspace of the connection and insert the
/// given rows. Run it inside a transaction.
pub async fn replace_for_connection<C: ConnectionTrait>(
    db: &C,
    connection_id: Uuid,
    workspaces: &[WorkspaceRecord],
    bases: &[BaseRecord],
) -> Result<(), DbErr> {
    Base::delete_many()
        .filter(base::Column::ConnectionId.eq(connection_id))
        .exec(db)
        .await?;
    Workspace::delete_many()
        .filter(workspace::Column::ConnectionId.eq(connection_id))
        .exec(db)
        .await?;

    let now: DateTimeWithTimeZone = Utc::now().into();

    if !workspaces.is_empty() {
        let rows = workspaces.iter().map(|record| workspace::ActiveModel {
            id: Set(record.id),
            connection_id: Set(connection_id),
            airtable_workspace_id: Set(record.airtable_workspace_id.clone()),
            name: Set(record.name.clone()),
            created_at: Set(now),
        });
        Workspace::insert_many(rows).exec_without_returning(db).await?;
    }

    if !bases.is_empty() {
        let rows = bases.iter().map(|record| base::ActiveModel {
            id: Set(record.id),
            connection_id: Set(connection_id),
            workspace_id: Set(record.workspace_id),
            airtable_base_id: Set(record.airtable_base_id.clone()),
            name: Set(record.name.clone()),
            permission_level: Set(record.permission_level.clone()),
            created_at: Set(now),
        });
        Base::insert_many(rows).exec_without_returning(db).await?;
    }

    Ok(())
}

/// Read access to the cached catalog
pub struct WorkspaceRepository {
    db: Arc<DatabaseConnection>,
}

impl WorkspaceRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn list_workspaces(&self, connection_id: Uuid) -> Result<Vec<workspace::Model>, DbErr> {
        Workspace::find()
            .filter(workspace::Column::ConnectionId.eq(connection_id))
            .order_by_asc(workspace::Column::Name)
            .all(&*self.db)
            .await
    }

    pub async fn list_bases(&self, connection_id: Uuid) -> Result<Vec<base::Model>, DbErr> {
        Base::find()
            .filter(base::Column::ConnectionId.eq(connection_id))
            .order_by_asc(base::Column::Name)
            .all(&*self.db)
            .await
    }

    pub async fn count_bases(&self, connection_id: Uuid) -> Result<u64, DbErr> {
        Base::find()
            .filter(base::Column::ConnectionId.eq(connection_id))
            .count(&*self.db)
            .await
    }
}
