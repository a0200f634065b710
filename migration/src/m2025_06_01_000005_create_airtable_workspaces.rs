//! Creates the airtable_workspaces table.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(AirtableWorkspaces::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(AirtableWorkspaces::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(AirtableWorkspaces::ConnectionId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(AirtableWorkspaces::AirtableWorkspaceId)
                            .text()
                            .not_null(),
                    )
                    .col(ColumnDef::new(AirtableWorkspaces::Name).text().not_null())
                    .col(
                        ColumnDef::new(AirtableWorkspaces::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .name("fk_airtable_workspaces_connection_id")
                            .from(AirtableWorkspaces::Table, AirtableWorkspaces::ConnectionId)
                            .to(AirtableConnections::Table, AirtableConnections::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_airtable_workspaces_connection_external")
                    .table(AirtableWorkspaces::Table)
                    .col(AirtableWorkspaces::ConnectionId)
                    .col(AirtableWorkspaces::AirtableWorkspaceId)
                    .unique()
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(AirtableWorkspaces::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum AirtableWorkspaces {
    Table,
    Id,
    ConnectionId,
    AirtableWorkspaceId,
    Name,
    CreatedAt,
}

#[derive(DeriveIden)]
enum AirtableConnections {
    Table,
    Id,
}
