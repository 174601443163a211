//! Error type for SSH session operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SshError {
    #[error("failed to reach {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("SSH handshake with {host} failed: {source}")]
    Handshake {
        host: String,
        #[source]
        source: ssh2::Error,
    },

    #[error("authentication failed for {user}@{host}: {reason}")]
    Auth {
        user: String,
        host: String,
        reason: String,
    },

    #[error("key file {0} does not exist")]
    KeyFileMissing(String),

    #[error("session is not connected")]
    NotConnected,

    #[error("channel error: {0}")]
    Channel(#[from] ssh2::Error),

    #[error("I/O error while reading command output: {0}")]
    Io(#[from] std::io::Error),
}

pub type SshResult<T> = Result<T, SshError>;
