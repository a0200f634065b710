//! # OAuth State Model
//!
//! Short-lived, single-use rows correlating an authorization redirect with
//! its callback.

use sea_orm::ActiveModelBehavior;
use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "oauth_states")]
pub struct Model {
    /// Primary key UUID
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    /// State token sent through the authorization redirect
    #[sea_orm(unique)]
    pub state: String,

    /// PKCE code verifier paired with the challenge sent to Airtable
    pub code_verifier: String,

    /// User who initiated the connect
    pub user_id: Uuid,

    /// Organization the connection will belong to
    pub organization_id: Uuid,

    /// Expiration timestamp
    pub expires_at: chrono::DateTime<chrono::Utc>,

    /// When the state was created
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
