//! Error type for the server list and credential vault.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid server list {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("server '{0}' has a stored password but no vault passphrase was given")]
    VaultLocked(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("credential blob is malformed: {0}")]
    Malformed(String),

    #[error("credential could not be decrypted (wrong passphrase or corrupted data)")]
    Decrypt,

    #[error("encryption failed")]
    Encrypt,
}

pub type StorageResult<T> = Result<T, StorageError>;
