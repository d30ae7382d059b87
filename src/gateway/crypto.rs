//! Credential encryption at rest.
//!
//! Blobs are `base64(nonce || ciphertext)` under AES-256-GCM with a 12-byte
//! random nonce. The process-wide key is loaded once at startup.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use anyhow::Context;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::fmt;
use thiserror::Error;

const NONCE_LEN: usize = 12;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CredentialError {
    #[error("encryption key must be base64 of exactly 32 bytes")]
    InvalidKey,
    #[error("credential blob is malformed")]
    Malformed,
    #[error("credential could not be decrypted")]
    Decrypt,
    #[error("credential could not be encrypted")]
    Encrypt,
}

/// A decrypted credential. Never printed, wiped on drop.
pub struct Credential(String);

impl Credential {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential([REDACTED])")
    }
}

impl Drop for Credential {
    fn drop(&mut self) {
        let mut bytes = std::mem::take(&mut self.0).into_bytes();
        bytes.fill(0);
        std::hint::black_box(&bytes);
    }
}

pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CredentialCipher { .. }")
    }
}

impl CredentialCipher {
    pub fn from_base64_key(encoded: &str) -> Result<Self, CredentialError> {
        let key = STANDARD
            .decode(encoded.trim())
            .map_err(|_| CredentialError::InvalidKey)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| CredentialError::InvalidKey)?;
        Ok(Self { cipher })
    }

    /// Loads the key from the named environment variable. Error messages name
    /// the variable, never its value.
    pub fn from_env(var_name: &str) -> anyhow::Result<Self> {
        let encoded = std::env::var(var_name)
            .with_context(|| format!("Encryption key variable {} is not set", var_name))?;
        Self::from_base64_key(&encoded)
            .with_context(|| format!("Encryption key in {} is unusable", var_name))
    }

    /// Fresh random key, base64 encoded.
    pub fn generate_key() -> String {
        STANDARD.encode(Aes256Gcm::generate_key(&mut OsRng))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, CredentialError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CredentialError::Encrypt)?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> Result<Credential, CredentialError> {
        let bytes = STANDARD
            .decode(blob.trim())
            .map_err(|_| CredentialError::Malformed)?;
        if bytes.len() <= NONCE_LEN {
            return Err(CredentialError::Malformed);
        }
        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CredentialError::Decrypt)?;
        String::from_utf8(plaintext)
            .map(Credential)
            .map_err(|_| CredentialError::Decrypt)
    }
}
