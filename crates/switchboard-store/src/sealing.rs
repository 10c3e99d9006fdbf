//! At-rest encryption for credential blobs.
//!
//! Sealed values are base64(nonce || ciphertext) under ChaCha20-Poly1305.

use std::path::Path;

use chacha20poly1305::aead::{Aead, KeyInit, OsRng};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};

const NONCE_LEN: usize = 12;

#[derive(Debug, thiserror::Error)]
pub enum SealError {
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("invalid encoding")]
    InvalidEncoding,
    #[error("invalid UTF-8")]
    InvalidUtf8,
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("IO error: {0}")]
    IoError(String),
}

pub struct CredentialSealer {
    key: [u8; 32],
}

impl CredentialSealer {
    pub fn new(key: [u8; 32]) -> Self {
        Self { key }
    }

    /// Sealer with a throwaway key, for in-memory databases.
    pub fn ephemeral() -> Self {
        Self::new(generate_key())
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, SealError> {
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let mut nonce_bytes = [0u8; NONCE_LEN];
        chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|_| SealError::EncryptionFailed)?;

        let mut combined = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        combined.extend_from_slice(&nonce_bytes);
        combined.extend_from_slice(&ciphertext);

        Ok(base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            &combined,
        ))
    }

    pub fn open(&self, sealed: &str) -> Result<String, SealError> {
        let combined =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, sealed)
                .map_err(|_| SealError::InvalidEncoding)?;

        if combined.len() < NONCE_LEN {
            return Err(SealError::InvalidEncoding);
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_LEN);
        let cipher = ChaCha20Poly1305::new((&self.key).into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| SealError::DecryptionFailed)?;

        String::from_utf8(plaintext).map_err(|_| SealError::InvalidUtf8)
    }
}

pub fn generate_key() -> [u8; 32] {
    let mut key = [0u8; 32];
    chacha20poly1305::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut key);
    key
}

/// Load the sealing key, creating it with 0600 permissions when absent.
pub fn load_or_create_key(path: &Path) -> Result<[u8; 32], SealError> {
    if path.exists() {
        let encoded =
            std::fs::read_to_string(path).map_err(|e| SealError::IoError(e.to_string()))?;
        let bytes =
            base64::Engine::decode(&base64::engine::general_purpose::STANDARD, encoded.trim())
                .map_err(|_| SealError::InvalidEncoding)?;
        let key: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SealError::InvalidKeyLength)?;
        return Ok(key);
    }

    let key = generate_key();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| SealError::IoError(e.to_string()))?;
    }
    let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, key);
    std::fs::write(path, &encoded).map_err(|e| SealError::IoError(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .map_err(|e| SealError::IoError(e.to_string()))?;
    }

    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_roundtrip() {
        let sealer = CredentialSealer::ephemeral();
        let sealed = sealer.seal(r#"{"noiseKey":"abc"}"#).unwrap();
        assert!(!sealed.contains("noiseKey"));
        assert_eq!(sealer.open(&sealed).unwrap(), r#"{"noiseKey":"abc"}"#);
    }

    #[test]
    fn wrong_key_fails() {
        let a = CredentialSealer::ephemeral();
        let b = CredentialSealer::ephemeral();
        let sealed = a.seal("secret").unwrap();
        assert!(matches!(b.open(&sealed), Err(SealError::DecryptionFailed)));
    }

    #[test]
    fn garbage_is_rejected() {
        let sealer = CredentialSealer::ephemeral();
        assert!(matches!(sealer.open("!!not base64!!"), Err(SealError::InvalidEncoding)));
        assert!(matches!(sealer.open("AAAA"), Err(SealError::InvalidEncoding)));
    }

    #[test]
    fn key_file_is_stable() {
        let dir = std::env::temp_dir().join(format!("switchboard-key-{}", uuid::Uuid::now_v7()));
        let path = dir.join("credential.key");
        let first = load_or_create_key(&path).unwrap();
        let second = load_or_create_key(&path).unwrap();
        assert_eq!(first, second);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
