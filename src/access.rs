//! Organization roles and plan limits.
//!
//! The connection lifecycle asks two collaborators before mutating anything:
//! [`RoleLookup`] for the caller's role in the organization and
//! [`PlanLimitsLookup`] for the organization's caps. Both have database-backed
//! implementations over `organization_members` and `organizations`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{DatabaseConnection, DbErr};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::repositories::OrganizationRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Owner,
    Admin,
    Member,
    Viewer,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Owner => "owner",
            Role::Admin => "admin",
            Role::Member => "member",
            Role::Viewer => "viewer",
        }
    }

    /// Owners and admins may connect and disconnect Airtable accounts.
    pub fn can_manage_connections(&self) -> bool {
        matches!(self, Role::Owner | Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "owner" => Ok(Role::Owner),
            "admin" => Ok(Role::Admin),
            "member" => Ok(Role::Member),
            "viewer" => Ok(Role::Viewer),
            other => Err(format!("unknown role '{other}'")),
        }
    }
}

/// Resource caps of a plan. `None` means unlimited.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanLimits {
    pub plan: String,
    pub max_connections: Option<u32>,
    pub max_bases: Option<u32>,
    pub max_members: Option<u32>,
    pub retention_days: u32,
}

impl PlanLimits {
    /// Caps for a plan slug; unknown plans get the free caps.
    pub fn for_plan(plan: &str) -> Self {
        let (plan, connections, bases, members, retention_days) = match plan {
            "pro" => ("pro", Some(5), Some(10), Some(20), 90),
            "enterprise" => ("enterprise", None, None, None, 365),
            _ => ("free", Some(1), Some(3), Some(5), 30),
        };

        Self {
            plan: plan.to_string(),
            max_connections: connections,
            max_bases: bases,
            max_members: members,
            retention_days,
        }
    }

    pub fn can_add_connection(&self, current: u64) -> bool {
        self.max_connections
            .is_none_or(|max| current < u64::from(max))
    }
}

#[async_trait]
pub trait RoleLookup: Send + Sync {
    /// Role of `user_id` in `organization_id`, `None` for non-members.
    async fn role_of(&self, organization_id: Uuid, user_id: Uuid) -> Result<Option<Role>, DbErr>;
}

#[async_trait]
pub trait PlanLimitsLookup: Send + Sync {
    /// Caps of the organization's plan, `None` when they cannot be determined.
    async fn limits_for(&self, organization_id: Uuid) -> Result<Option<PlanLimits>, DbErr>;
}

/// Role and plan lookups backed by the organization tables.
#[derive(Clone)]
pub struct DbAccess {
    db: Arc<DatabaseConnection>,
}

impl DbAccess {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl RoleLookup for DbAccess {
    async fn role_of(&self, organization_id: Uuid, user_id: Uuid) -> Result<Option<Role>, DbErr> {
        let membership = OrganizationRepository::new(self.db.clone())
            .find_membership(organization_id, user_id)
            .await?;

        Ok(membership.and_then(|member| match member.role.parse::<Role>() {
            Ok(role) => Some(role),
            Err(error) => {
                tracing::warn!(%organization_id, %user_id, %error, "Ignoring membership with unknown role");
                None
            }
        }))
    }
}

#[async_trait]
impl PlanLimitsLookup for DbAccess {
    async fn limits_for(&self, organization_id: Uuid) -> Result<Option<PlanLimits>, DbErr> {
        let organization = OrganizationRepository::new(self.db.clone())
            .find_by_id(organization_id)
            .await?;

        Ok(organization.map(|org| PlanLimits::for_plan(&org.plan)))
    }
}
