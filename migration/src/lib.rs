//! Database migrations for the basewatch connection service.

pub use sea_orm_migration::prelude::*;

mod m2025_06_01_000001_create_organizations;
mod m2025_06_01_000002_create_organization_members;
mod m2025_06_01_000003_create_airtable_connections;
mod m2025_06_01_000004_create_oauth_states;
mod m2025_06_01_000005_create_airtable_workspaces;
mod m2025_06_01_000006_create_airtable_bases;
mod m2025_06_01_000007_create_vault_secrets;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m2025_06_01_000001_create_organizations::Migration),
            Box::new(m2025_06_01_000002_create_organization_members::Migration),
            Box::new(m2025_06_01_000003_create_airtable_connections::Migration),
            Box::new(m2025_06_01_000004_create_oauth_states::Migration),
            Box::new(m2025_06_01_000005_create_airtable_workspaces::Migration),
            Box::new(m2025_06_01_000006_create_airtable_bases::Migration),
            Box::new(m2025_06_01_000007_create_vault_secrets::Migration),
        ]
    }
}
