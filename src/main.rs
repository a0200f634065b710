//! # Basewatch Main Entry Point
//!
//! `serve` (default) runs the API, `migrate` applies migrations and
//! `sweep-states` removes expired OAuth states once.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use basewatch::{
    airtable::AirtableClient,
    config::{AppConfig, ConfigLoader},
    crypto::CryptoKey,
    db::init_pool,
    housekeeping::StateSweeper,
    migration::{Migrator, MigratorTrait},
    server::run_server,
    telemetry::init_tracing,
    vault::{EncryptedVault, SecretVault},
};
use clap::{Parser, Subcommand};
use sea_orm::DatabaseConnection;

#[derive(Debug, Parser)]
#[command(name = "basewatch", version, about = "Airtable connection service")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Apply migrations and serve the HTTP API
    Serve,
    /// Apply pending database migrations and exit
    Migrate,
    /// Delete expired OAuth states once and exit
    SweepStates,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = ConfigLoader::new().load()?;
    init_tracing(&config)?;

    if let Ok(redacted_json) = config.redacted_json() {
        tracing::debug!(config = %redacted_json, "Loaded configuration");
    }

    let db = init_pool(&config).await?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Migrate => {
            Migrator::up(&db, None).await.context("Failed to apply migrations")?;
            tracing::info!("Migrations applied");
        }
        Command::SweepStates => {
            let sweeper = StateSweeper::new(Arc::new(db), Duration::ZERO);
            let removed = sweeper.tick().await?;
            tracing::info!(removed, "Expired OAuth states removed");
        }
        Command::Serve => {
            Migrator::up(&db, None).await.context("Failed to apply migrations")?;

            let vault = build_vault(&config, &db)?;
            let airtable = Arc::new(AirtableClient::new(&config.airtable)?);
            run_server(config, db, vault, airtable).await?;
        }
    }

    Ok(())
}

fn build_vault(config: &AppConfig, db: &DatabaseConnection) -> anyhow::Result<Arc<dyn SecretVault>> {
    let key = config
        .crypto_key
        .clone()
        .context("BASEWATCH_CRYPTO_KEY is required")?;
    Ok(Arc::new(EncryptedVault::new(
        Arc::new(db.clone()),
        CryptoKey::new(key)?,
    )))
}
