//! AES-256-GCM sealing for vault secrets.
//!
//! Payload layout: `version (1) | nonce (12) | ciphertext + tag`. Additional
//! authenticated data binds a ciphertext to the row it was written for, so a
//! ciphertext copied onto another secret row fails to open.

#![allow(deprecated)]

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
};
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

const VERSION_ENCRYPTED: u8 = 0x01;
const VERSION_FIELD_LEN: usize = 1;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MIN_ENCRYPTED_LEN: usize = VERSION_FIELD_LEN + NONCE_LEN + TAG_LEN;

/// Crypto error types
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid ciphertext format")]
    InvalidFormat,
    #[error("unsupported ciphertext version {0:#04x}")]
    UnsupportedVersion(u8),
}

/// Secure wrapper for encryption keys with zeroization
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct ZeroizingKey(Vec<u8>);

/// Type alias for crypto keys
pub type CryptoKey = ZeroizingKey;

impl CryptoKey {
    /// Create a new crypto key from bytes
    pub fn new(bytes: Vec<u8>) -> Result<Self, CryptoError> {
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidKeyLength(bytes.len()));
        }
        Ok(ZeroizingKey(bytes))
    }

    /// Get the key as bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Debug for ZeroizingKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ZeroizingKey([REDACTED])")
    }
}

/// Encrypt bytes using AES-256-GCM
pub fn encrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

    let mut ciphertext = cipher
        .encrypt(
            &nonce,
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut result = Vec::with_capacity(VERSION_FIELD_LEN + NONCE_LEN + ciphertext.len());
    result.push(VERSION_ENCRYPTED);
    result.extend_from_slice(&nonce);
    result.append(&mut ciphertext);

    Ok(result)
}

/// Decrypt bytes using AES-256-GCM
pub fn decrypt_bytes(
    key: &CryptoKey,
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    let Some(&version) = ciphertext.first() else {
        return Err(CryptoError::InvalidFormat);
    };

    if version != VERSION_ENCRYPTED {
        return Err(CryptoError::UnsupportedVersion(version));
    }

    if ciphertext.len() < MIN_ENCRYPTED_LEN {
        return Err(CryptoError::InvalidFormat);
    }

    let nonce = Nonce::from_slice(&ciphertext[VERSION_FIELD_LEN..VERSION_FIELD_LEN + NONCE_LEN]);
    let tag_and_ct = &ciphertext[VERSION_FIELD_LEN + NONCE_LEN..];

    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));

    cipher
        .decrypt(
            nonce,
            Payload {
                msg: tag_and_ct,
                aad,
            },
        )
        .map_err(|_| CryptoError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> CryptoKey {
        CryptoKey::new(vec![0u8; 32]).expect("valid test key")
    }

    #[test]
    fn roundtrip_with_matching_aad() {
        let key = test_key();
        let encrypted = encrypt_bytes(&key, b"conn|access", b"tok_123").unwrap();

        let decrypted = decrypt_bytes(&key, b"conn|access", &encrypted).unwrap();

        assert_eq!(decrypted, b"tok_123");
    }

    #[test]
    fn different_aad_fails() {
        let key = test_key();
        let encrypted = encrypt_bytes(&key, b"conn|access", b"tok_123").unwrap();

        let result = decrypt_bytes(&key, b"conn|refresh", &encrypted);

        assert!(matches!(result, Err(CryptoError::DecryptionFailed)));
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = test_key();
        let mut encrypted = encrypt_bytes(&key, b"aad", b"secret message").unwrap();
        encrypted[13] ^= 0x01;

        assert!(decrypt_bytes(&key, b"aad", &encrypted).is_err());
    }

    #[test]
    fn nonces_differ_between_encryptions() {
        let key = test_key();
        let first = encrypt_bytes(&key, b"aad", b"same").unwrap();
        let second = encrypt_bytes(&key, b"aad", b"same").unwrap();

        assert_ne!(&first[1..13], &second[1..13]);
    }

    #[test]
    fn unversioned_payload_is_rejected() {
        let key = test_key();

        let result = decrypt_bytes(&key, b"aad", b"plaintext-token");

        assert!(matches!(result, Err(CryptoError::UnsupportedVersion(b'p'))));
        assert!(matches!(
            decrypt_bytes(&key, b"aad", &[]),
            Err(CryptoError::InvalidFormat)
        ));
    }

    #[test]
    fn truncated_payload_is_rejected() {
        let key = test_key();

        let result = decrypt_bytes(&key, b"aad", &[VERSION_ENCRYPTED, 0x02]);

        assert!(matches!(result, Err(CryptoError::InvalidFormat)));
    }

    #[test]
    fn key_length_is_enforced_and_debug_is_redacted() {
        assert!(matches!(
            CryptoKey::new(vec![0u8; 16]),
            Err(CryptoError::InvalidKeyLength(16))
        ));

        let key = CryptoKey::new(vec![9u8; 32]).unwrap();
        assert_eq!(format!("{:?}", key), "ZeroizingKey([REDACTED])");
    }
}
