//! Credential cipher for secret sink fields
//!
//! Secrets (basic-auth passwords, bearer tokens) are stored encrypted at rest.
//! The key is the SHA-256 digest of an operator-supplied passphrase; every
//! encryption draws a fresh 96-bit nonce which is prepended to the AES-256-GCM
//! ciphertext, and the whole buffer is hex-encoded for storage in JSON.

use std::fmt;

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Length of the GCM nonce prefix in bytes
pub const NONCE_LEN: usize = 12;

/// Length of the GCM authentication tag in bytes
const TAG_LEN: usize = 16;

/// Errors during credential encryption/decryption
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    #[error("Failed to encrypt secret value")]
    Encrypt,

    #[error("Failed to decrypt secret value: {0}")]
    Decrypt(String),
}

/// Symmetric cipher bound to one passphrase
#[derive(Clone)]
pub struct CredentialCipher {
    key: [u8; 32],
}

impl CredentialCipher {
    /// Derive the 256-bit key from a passphrase
    pub fn new(passphrase: &str) -> Self {
        let digest = Sha256::digest(passphrase.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self { key }
    }

    fn aead(&self) -> Result<Aes256Gcm, CipherError> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|_| CipherError::Encrypt)
    }

    /// Encrypt `plaintext` and return `hex(nonce || ciphertext || tag)`
    pub fn encode(&self, plaintext: &str) -> Result<String, CipherError> {
        let aead = self.aead()?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = aead
            .encrypt(&nonce, plaintext.as_bytes())
            .map_err(|_| CipherError::Encrypt)?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&ciphertext);
        Ok(hex::encode(sealed))
    }

    /// Decrypt a value produced by [`CredentialCipher::encode`]
    ///
    /// Fails on bad hex, truncated input, or an authentication tag mismatch.
    pub fn decode(&self, ciphertext_hex: &str) -> Result<String, CipherError> {
        let sealed = hex::decode(ciphertext_hex.trim())
            .map_err(|e| CipherError::Decrypt(format!("invalid hex: {}", e)))?;

        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Decrypt(format!(
                "ciphertext too short ({} bytes)",
                sealed.len()
            )));
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let aead = self.aead().map_err(|_| CipherError::Decrypt("bad key".to_string()))?;
        let plaintext = aead
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CipherError::Decrypt("authentication failed".to_string()))?;

        String::from_utf8(plaintext)
            .map_err(|_| CipherError::Decrypt("plaintext is not valid UTF-8".to_string()))
    }
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher")
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Encrypt `plaintext` under `passphrase`
pub fn encode(plaintext: &str, passphrase: &str) -> Result<String, CipherError> {
    CredentialCipher::new(passphrase).encode(plaintext)
}

/// Decrypt `ciphertext_hex` under `passphrase`
pub fn decode(ciphertext_hex: &str, passphrase: &str) -> Result<String, CipherError> {
    CredentialCipher::new(passphrase).decode(ciphertext_hex)
}
