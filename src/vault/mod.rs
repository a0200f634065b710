//! Secret vault for OAuth tokens.
//!
//! Connections only ever hold the opaque secret ids returned by
//! [`SecretVault::store`]; raw tokens stay inside the vault and are read back
//! per operation without caching.

pub mod encrypted;
pub mod memory;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::crypto::CryptoError;

pub use encrypted::EncryptedVault;
pub use memory::InMemoryVault;

/// Kind of token held by a secret
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TokenType {
    type Err = VaultError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "access" => Ok(TokenType::Access),
            "refresh" => Ok(TokenType::Refresh),
            other => Err(VaultError::Corrupt(format!("unknown token type '{other}'"))),
        }
    }
}

/// A raw token read back from the vault. Wiped on drop and never printed.
#[derive(Clone)]
pub struct SecretToken(Zeroizing<String>);

impl SecretToken {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(Zeroizing::new(raw.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }
}

impl fmt::Debug for SecretToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretToken([REDACTED])")
    }
}

/// Vault failures. Any of these leaves the connection without usable tokens.
#[derive(Debug, Error)]
pub enum VaultError {
    #[error("vault storage error: {0}")]
    Storage(#[from] sea_orm::DbErr),
    #[error("vault crypto error: {0}")]
    Crypto(#[from] CryptoError),
    #[error("vault secret is corrupt: {0}")]
    Corrupt(String),
    #[error("vault unavailable")]
    Unavailable,
}

/// Store, read and purge opaque token secrets.
#[async_trait]
pub trait SecretVault: Send + Sync {
    /// Persist a new secret and return its id. Never overwrites an existing secret.
    async fn store(
        &self,
        connection_id: Uuid,
        token_type: TokenType,
        raw_token: &str,
    ) -> Result<Uuid, VaultError>;

    /// Read a secret back; `None` when the id is unknown.
    async fn retrieve(&self, secret_id: Uuid) -> Result<Option<SecretToken>, VaultError>;

    /// Remove every secret stored for the connection, returning how many were removed.
    async fn delete_all(&self, connection_id: Uuid) -> Result<u64, VaultError>;
}
