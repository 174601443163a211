//! Credential vault for stored server passwords.
//!
//! - **Key derivation**: Argon2id over passphrase + 16-byte random salt
//! - **Encryption**: AES-256-GCM with a random 96-bit nonce
//! - **Blob format**: base64(salt ‖ nonce ‖ ciphertext)

use crate::error::{StorageError, StorageResult};
use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

/// Holds the session passphrase; every blob carries its own salt.
pub struct Vault {
    passphrase: SecretString,
}

impl Vault {
    pub fn new(passphrase: SecretString) -> Self {
        Self { passphrase }
    }

    fn derive_key(&self, salt: &[u8]) -> StorageResult<[u8; KEY_LEN]> {
        let mut key = [0u8; KEY_LEN];
        Argon2::default()
            .hash_password_into(self.passphrase.expose_secret().as_bytes(), salt, &mut key)
            .map_err(|e| StorageError::Kdf(e.to_string()))?;
        Ok(key)
    }

    pub fn encrypt(&self, plaintext: &str) -> StorageResult<String> {
        let mut salt = [0u8; SALT_LEN];
        let mut nonce = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut salt);
        rand::thread_rng().fill_bytes(&mut nonce);

        let key = self.derive_key(&salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| StorageError::Encrypt)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext.as_bytes())
            .map_err(|_| StorageError::Encrypt)?;

        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(STANDARD.encode(blob))
    }

    pub fn decrypt(&self, blob: &str) -> StorageResult<SecretString> {
        let raw = STANDARD
            .decode(blob.trim())
            .map_err(|e| StorageError::Malformed(e.to_string()))?;
        if raw.len() <= SALT_LEN + NONCE_LEN {
            return Err(StorageError::Malformed(format!(
                "{} bytes is too short",
                raw.len()
            )));
        }
        let (salt, rest) = raw.split_at(SALT_LEN);
        let (nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let key = self.derive_key(salt)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| StorageError::Decrypt)?;
        let plain = cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| StorageError::Decrypt)?;
        let text = String::from_utf8(plain).map_err(|_| StorageError::Decrypt)?;
        Ok(SecretString::new(text))
    }
}
