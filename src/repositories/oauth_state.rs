//! # OAuth State Repository
//!
//! Persistence for single-use authorization states.

use chrono::{Duration, Utc};
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter, Set};
use std::sync::Arc;
use uuid::Uuid;

use crate::models::oauth_state::{self, ActiveModel, Entity, Model};

/// Repository for OAuth state database operations
pub struct OAuthStateRepository {
    db: Arc<DatabaseConnection>,
}

impl OAuthStateRepository {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Create a new OAuth state record
    pub async fn create(
        &self,
        organization_id: Uuid,
        user_id: Uuid,
        state: &str,
        code_verifier: &str,
        expires_in_minutes: i64,
    ) -> Result<Model, sea_orm::DbErr> {
        let now = Utc::now();
        let model = Model {
            id: Uuid::new_v4(),
            state: state.to_string(),
            code_verifier: code_verifier.to_string(),
            user_id,
            organization_id,
            expires_at: now + Duration::minutes(expires_in_minutes),
            created_at: now,
        };

        let active = ActiveModel {
            id: Set(model.id),
            state: Set(model.state.clone()),
            code_verifier: Set(model.code_verifier.clone()),
            user_id: Set(model.user_id),
            organization_id: Set(model.organization_id),
            expires_at: Set(model.expires_at),
            created_at: Set(model.created_at),
        };

        Entity::insert(active)
            .exec_without_returning(&*self.db)
            .await?;

        Ok(model)
    }

    /// Delete the state row and return it if it existed and had not expired.
    ///
    /// The row is removed whether or not it is still valid, and only the caller
    /// whose delete actually removed it gets the model back, so two callbacks
    /// racing on one state cannot both succeed.
    pub async fn consume(&self, state: &str) -> Result<Option<Model>, sea_orm::DbErr> {
        let Some(found) = Entity::find()
            .filter(oauth_state::Column::State.eq(state))
            .one(&*self.db)
            .await?
        else {
            return Ok(None);
        };

        let deleted = Entity::delete_by_id(found.id).exec(&*self.db).await?;
        if deleted.rows_affected == 0 {
            return Ok(None);
        }

        if found.expires_at <= Utc::now() {
            return Ok(None);
        }

        Ok(Some(found))
    }

    /// Clean up expired OAuth states
    pub async fn cleanup_expired(&self) -> Result<u64, sea_orm::DbErr> {
        let result = Entity::delete_many()
            .filter(oauth_state::Column::ExpiresAt.lt(Utc::now()))
            .exec(&*self.db)
            .await?;

        Ok(result.rows_affected)
    }

    /// States pending for an organization (expired ones included until swept)
    pub async fn count_by_organization(
        &self,
        organization_id: Uuid,
    ) -> Result<u64, sea_orm::DbErr> {
        Entity::find()
            .filter(oauth_state::Column::OrganizationId.eq(organization_id))
            .count(&*self.db)
            .await
    }
}
