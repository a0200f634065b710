use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(OAuthState::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(OAuthState::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(OAuthState::State).string().not_null())
                    .col(ColumnDef::new(OAuthState::CodeVerifier).string().not_null())
                    .col(ColumnDef::new(OAuthState::UserId).uuid().not_null())
                    .col(ColumnDef::new(OAuthState::OrganizationId).uuid().not_null())
                    .col(
                        ColumnDef::new(OAuthState::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(OAuthState::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_oauth_states_state")
                    .table(OAuthState::Table)
                    .col(OAuthState::State)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // Expiry sweep scans by expires_at
        manager
            .create_index(
                Index::create()
                    .name("idx_oauth_states_expires_at")
                    .table(OAuthState::Table)
                    .col(OAuthState::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(OAuthState::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum OAuthState {
    #[sea_orm(iden = "oauth_states")]
    Table,
    Id,
    State,
    CodeVerifier,
    UserId,
    OrganizationId,
    ExpiresAt,
    CreatedAt,
}
