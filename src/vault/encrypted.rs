//! Vault backed by the `vault_secrets` table with AES-256-GCM payloads.

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{SecretToken, SecretVault, TokenType, VaultError};
use crate::crypto::{CryptoKey, decrypt_bytes, encrypt_bytes};
use crate::models::vault_secret::{self, Entity as VaultSecret};

pub struct EncryptedVault {
    db: Arc<DatabaseConnection>,
    key: CryptoKey,
}

impl EncryptedVault {
    pub fn new(db: Arc<DatabaseConnection>, key: CryptoKey) -> Self {
        Self { db, key }
    }
}

/// Binds a ciphertext to the row it was written for.
fn associated_data(connection_id: Uuid, token_type: TokenType, secret_id: Uuid) -> Vec<u8> {
    format!("{connection_id}|{}|{secret_id}", token_type.as_str()).into_bytes()
}

#[async_trait]
impl SecretVault for EncryptedVault {
    async fn store(
        &self,
        connection_id: Uuid,
        token_type: TokenType,
        raw_token: &str,
    ) -> Result<Uuid, VaultError> {
        let secret_id = Uuid::new_v4();
        let aad = associated_data(connection_id, token_type, secret_id);
        let ciphertext = encrypt_bytes(&self.key, &aad, raw_token.as_bytes())?;

        let row = vault_secret::ActiveModel {
            id: Set(secret_id),
            connection_id: Set(connection_id),
            token_type: Set(token_type.as_str().to_string()),
            ciphertext: Set(ciphertext),
            created_at: Set(Utc::now().into()),
        };
        VaultSecret::insert(row)
            .exec_without_returning(&*self.db)
            .await?;

        debug!(%connection_id, %secret_id, token_type = %token_type, "Stored vault secret");
        Ok(secret_id)
    }

    async fn retrieve(&self, secret_id: Uuid) -> Result<Option<SecretToken>, VaultError> {
        let Some(row) = VaultSecret::find_by_id(secret_id).one(&*self.db).await? else {
            return Ok(None);
        };

        let token_type: TokenType = row.token_type.parse()?;
        let aad = associated_data(row.connection_id, token_type, row.id);
        let plaintext = decrypt_bytes(&self.key, &aad, &row.ciphertext)?;
        let raw = String::from_utf8(plaintext)
            .map_err(|_| VaultError::Corrupt("secret is not valid UTF-8".to_string()))?;

        Ok(Some(SecretToken::new(raw)))
    }

    async fn delete_all(&self, connection_id: Uuid) -> Result<u64, VaultError> {
        let result = VaultSecret::delete_many()
            .filter(vault_secret::Column::ConnectionId.eq(connection_id))
            .exec(&*self.db)
            .await?;

        debug!(%connection_id, removed = result.rows_affected, "Purged vault secrets");
        Ok(result.rows_affected)
    }
}
