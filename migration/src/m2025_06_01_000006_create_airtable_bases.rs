//! Creates the airtable_bases table.
//!
//! `connection_id` is denormalized from the owning workspace so bases can be
//! listed and cleared per connection without a join.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AirtableBases::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AirtableBases::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(AirtableBases::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(AirtableBases::WorkspaceId).uuid().not_null())
                    .col(ColumnDef::new(AirtableBases::AirtableBaseId).text().not_null())
                    .col(ColumnDef::new(AirtableBases::Name).text().not_null())
                    .col(ColumnDef::new(AirtableBases::PermissionLevel).text().null())
                    .col(
                        ColumnDef::new(AirtableBases::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_airtable_bases_connection_id")
                            .from(AirtableBases::Table, AirtableBases::ConnectionId)
                            .to(AirtableConnections::Table, AirtableConnections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_airtable_bases_workspace_id")
                            .from(AirtableBases::Table, AirtableBases::WorkspaceId)
                            .to(AirtableWorkspaces::Table, AirtableWorkspaces::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_airtable_bases_connection_external")
                    .table(AirtableBases::Table)
                    .col(AirtableBases::ConnectionId)
                    .col(AirtableBases::AirtableBaseId)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AirtableBases::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AirtableBases {
    Table,
    Id,
    ConnectionId,
    WorkspaceId,
    AirtableBaseId,
    Name,
    PermissionLevel,
    CreatedAt,
}

#[derive(DeriveIden)]
enum AirtableConnections {
    Table,
    Id,
}

#[derive(DeriveIden)]
enum AirtableWorkspaces {
    Table,
    Id,
}
