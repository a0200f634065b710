//! Organization and membership repository

use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::organization::{self, Entity as Organization};
use crate::models::organization_member::{self, Entity as OrganizationMember};

pub struct OrganizationRepository {
    db: Arc<DatabaseConnection>,
}

impl OrganizationRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    pub async fn find_by_id(&self, id: Uuid) -> Result<Option<organization::Model>, DbErr> {
        Organization::find_by_id(id).one(&*self.db).await
    }

    pub async fn create(&self, name: &str, plan: &str) -> Result<organization::Model, DbErr> {
        let model = organization::Model {
            id: Uuid::new_v4(),
            name: name.to_string(),
            plan: plan.to_string(),
            created_at: Utc::now().into(),
        };

        let active = organization::ActiveModel {
            id: Set(model.id),
            name: Set(model.name.clone()),
            plan: Set(model.plan.clone()),
            created_at: Set(model.created_at),
        };
        Organization::insert(active)
            .exec_without_returning(&*self.db)
            .await?;

        Ok(model)
    }

    /// Adds a user to an organization with the given role slug.
    pub async fn add_member(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        role: &str,
    ) -> Result<(), DbErr> {
        let active = organization_member::ActiveModel {
            id: Set(Uuid::new_v4()),
            organization_id: Set(organization_id),
            user_id: Set(user_id),
            role: Set(role.to_string()),
            created_at: Set(Utc::now().into()),
        };
        OrganizationMember::insert(active)
            .exec_without_returning(&*self.db)
            .await?;
        Ok(())
    }

    pub async fn find_membership(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<organization_member::Model>, DbErr> {
        OrganizationMember::find()
            .filter(organization_member::Column::OrganizationId.eq(organization_id))
            .filter(organization_member::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await
    }
}
