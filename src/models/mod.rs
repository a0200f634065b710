//! # Data Models
//!
//! SeaORM entities for organizations, Airtable connections and their cached
//! workspaces and bases, OAuth states and vault secrets.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod base;
pub mod connection;
pub mod oauth_state;
pub mod organization;
pub mod organization_member;
pub mod vault_secret;
pub mod workspace;

pub use base::Entity as Base;
pub use connection::Entity as Connection;
pub use oauth_state::Entity as OAuthState;
pub use organization::Entity as Organization;
pub use organization_member::Entity as OrganizationMember;
pub use vault_secret::Entity as VaultSecret;
pub use workspace::Entity as Workspace;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "basewatch".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
