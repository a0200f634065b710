//! In-process vault for the local profile and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{SecretToken, SecretVault, TokenType, VaultError};

#[derive(Debug, Clone)]
struct Entry {
    connection_id: Uuid,
    token_type: TokenType,
    token: SecretToken,
}

#[derive(Debug, Default)]
pub struct InMemoryVault {
    entries: Mutex<HashMap<Uuid, Entry>>,
    unavailable: AtomicBool,
}

impl InMemoryVault {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with [`VaultError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of secrets currently held for a connection.
    pub async fn count_for(&self, connection_id: Uuid) -> usize {
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.connection_id == connection_id)
            .count()
    }

    /// Token type of a stored secret.
    pub async fn token_type_of(&self, secret_id: Uuid) -> Option<TokenType> {
        self.entries
            .lock()
            .await
            .get(&secret_id)
            .map(|entry| entry.token_type)
    }

    fn check_available(&self) -> Result<(), VaultError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(VaultError::Unavailable);
        }
        Ok(())
    }
}

#[async_trait]
impl SecretVault for InMemoryVault {
    async fn store(
        &self,
        connection_id: Uuid,
        token_type: TokenType,
        raw_token: &str,
    ) -> Result<Uuid, VaultError> {
        self.check_available()?;

        let secret_id = Uuid::new_v4();
        self.entries.lock().await.insert(
            secret_id,
            Entry {
                connection_id,
                token_type,
                token: SecretToken::new(raw_token),
            },
        );
        Ok(secret_id)
    }

    async fn retrieve(&self, secret_id: Uuid) -> Result<Option<SecretToken>, VaultError> {
        self.check_available()?;

        Ok(self
            .entries
            .lock()
            .await
            .get(&secret_id)
            .map(|entry| entry.token.clone()))
    }

    async fn delete_all(&self, connection_id: Uuid) -> Result<u64, VaultError> {
        self.check_available()?;

        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| entry.connection_id != connection_id);
        Ok((before - entries.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn each_store_creates_a_new_secret() {
        let vault = InMemoryVault::new();
        let connection_id = Uuid::new_v4();

        let first = vault.store(connection_id, TokenType::Access, "a1").await.unwrap();
        let second = vault.store(connection_id, TokenType::Access, "a2").await.unwrap();

        assert_ne!(first, second);
        assert_eq!(vault.retrieve(first).await.unwrap().unwrap().expose(), "a1");
        assert_eq!(vault.count_for(connection_id).await, 2);
    }

    #[tokio::test]
    async fn delete_all_only_touches_one_connection() {
        let vault = InMemoryVault::new();
        let mine = Uuid::new_v4();
        let other = Uuid::new_v4();
        vault.store(mine, TokenType::Access, "a").await.unwrap();
        vault.store(mine, TokenType::Refresh, "r").await.unwrap();
        let kept = vault.store(other, TokenType::Access, "x").await.unwrap();

        assert_eq!(vault.delete_all(mine).await.unwrap(), 2);
        assert_eq!(vault.count_for(mine).await, 0);
        assert!(vault.retrieve(kept).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unavailable_vault_fails_every_call() {
        let vault = InMemoryVault::new();
        vault.set_unavailable(true);

        assert!(matches!(
            vault.retrieve(Uuid::new_v4()).await,
            Err(VaultError::Unavailable)
        ));
    }
}
