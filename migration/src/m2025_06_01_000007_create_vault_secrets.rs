//! Creates the vault_secrets table used by the encrypted secret vault.
//!
//! Rows reference a connection id without a foreign key; they are removed
//! through the vault's `delete_all` on disconnect.

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(VaultSecrets::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(VaultSecrets::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(VaultSecrets::ConnectionId).uuid().not_null())
                    .col(ColumnDef::new(VaultSecrets::TokenType).text().not_null())
                    .col(ColumnDef::new(VaultSecrets::Ciphertext).binary().not_null())
                    .col(
                        ColumnDef::new(VaultSecrets::CreatedAt)
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
                    .name("idx_vault_secrets_connection_id")
                    .table(VaultSecrets::Table)
                    .col(VaultSecrets::ConnectionId)
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(VaultSecrets::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum VaultSecrets {
    Table,
    Id,
    ConnectionId,
    TokenType,
    Ciphertext,
    CreatedAt,
}
