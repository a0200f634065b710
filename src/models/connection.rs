//! Airtable connection entity model
//!
//! One row links one Airtable account to one organization. Access and refresh
//! tokens are held by the secret vault; the row only keeps the secret ids.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;
use sea_orm::prelude::DateTimeWithTimeZone;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "airtable_connections")]
pub struct Model {
    /// Unique identifier for the connection (primary key)
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// Owning organization
    pub organization_id: Uuid,

    /// User who completed the OAuth flow
    pub user_id: Uuid,

    /// Airtable account id reported by `/meta/whoami`
    pub airtable_user_id: String,

    pub airtable_email: Option<String>,

    /// Lifecycle status (`pending_sync`, `active`, `error`, `disconnected`)
    pub status: String,

    /// Vault id of the current access token
    pub access_token_secret_id: Option<Uuid>,

    /// Vault id of the current refresh token
    pub refresh_token_secret_id: Option<Uuid>,

    pub token_expires_at: Option<DateTimeWithTimeZone>,

    /// Time of the last successful workspace/base sync
    pub last_sync_at: Option<DateTimeWithTimeZone>,

    pub error_message: Option<String>,

    pub workspace_count: i32,

    pub base_count: i32,

    /// Granted OAuth scopes (JSON array of strings)
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub scopes: Option<JsonValue>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::organization::Entity",
        from = "Column::OrganizationId",
        to = "super::organization::Column::Id",
        on_delete = "Cascade"
    )]
    Organization,
    #[sea_orm(has_many = "super::workspace::Entity")]
    Workspaces,
    #[sea_orm(has_many = "super::base::Entity")]
    Bases,
}

impl Related<super::organization::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Organization.def()
    }
}

impl Related<super::workspace::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Workspaces.def()
    }
}

impl Related<super::base::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Bases.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

impl Model {
    /// Scopes as a list of strings, ignoring malformed entries.
    pub fn scope_list(&self) -> Vec<String> {
        match &self.scopes {
            Some(JsonValue::Array(values)) => values
                .iter()
                .filter_map(|value| value.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}
