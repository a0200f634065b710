//! Creates the airtable_connections table.
//!
//! One row links one Airtable account to one organization. Tokens live in the
//! vault; this table only stores the opaque secret ids returned by it.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AirtableConnections::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AirtableConnections::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AirtableConnections::OrganizationId)
                            .uuid()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AirtableConnections::UserId).uuid().not_null())
                    .col(
                        ColumnDef::new(AirtableConnections::AirtableUserId)
                            .text()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AirtableConnections::AirtableEmail)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AirtableConnections::Status)
                            .text()
                            .not_null()
                            .default("pending_sync"),
                    )
                    .col(
                        ColumnDef::new(AirtableConnections::AccessTokenSecretId)
                            .uuid()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AirtableConnections::RefreshTokenSecretId)
                            .uuid()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AirtableConnections::TokenExpiresAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AirtableConnections::LastSyncAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AirtableConnections::ErrorMessage)
                            .text()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(AirtableConnections::WorkspaceCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(AirtableConnections::BaseCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(AirtableConnections::Scopes).json_binary().null())
                    .col(
                        ColumnDef::new(AirtableConnections::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .col(
                        ColumnDef::new(AirtableConnections::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_airtable_connections_organization_id")
                            .from(
                                AirtableConnections::Table,
                                AirtableConnections::OrganizationId,
                            )
                            .to(Organizations::Table, Organizations::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // At most one connection per (organization, Airtable account)
        manager
            .create_index(
                Index::create()
                    .name("idx_airtable_connections_org_airtable_user")
                    .table(AirtableConnections::Table)
                    .col(AirtableConnections::OrganizationId)
                    .col(AirtableConnections::AirtableUserId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_airtable_connections_organization_id")
                    .table(AirtableConnections::Table)
                    .col(AirtableConnections::OrganizationId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_index(
                Index::drop()
                    .name("idx_airtable_connections_org_airtable_user")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_index(
                Index::drop()
                    .name("idx_airtable_connections_organization_id")
                    .to_owned(),
            )
            .await?;

        manager
            .drop_table(Table::drop().table(AirtableConnections::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AirtableConnections {
    Table,
    Id,
    OrganizationId,
    UserId,
    AirtableUserId,
    AirtableEmail,
    Status,
    AccessTokenSecretId,
    RefreshTokenSecretId,
    TokenExpiresAt,
    LastSyncAt,
    ErrorMessage,
    WorkspaceCount,
    BaseCount,
    Scopes,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum Organizations {
    Table,
    Id,
}
