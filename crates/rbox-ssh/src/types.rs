use secrecy::SecretString;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_SSH_PORT: u16 = 22;
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

// ===============================
// Connection parameters
// ===============================

/// Everything needed to open (and later re-open) a session.
///
/// `secret` is the single stored credential: the passphrase of `key_file`
/// when a key file is configured, otherwise the password that also answers
/// every keyboard-interactive prompt.
#[derive(Debug)]
pub struct SshParams {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub secret: Option<SecretString>,
    pub key_file: Option<PathBuf>,
    pub connect_timeout: Duration,
}

impl SshParams {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            username: username.into(),
            secret: None,
            key_file: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_secret(mut self, secret: SecretString) -> Self {
        self.secret = Some(secret);
        self
    }

    pub fn with_key_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.key_file = Some(path.into());
        self
    }

    /// `user@host:port`, used in log lines.
    pub fn display_target(&self) -> String {
        format!("{}@{}:{}", self.username, self.host, self.port)
    }
}

// ===============================
// Execution results
// ===============================

/// Which remote stream a chunk of live output came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Raw result of one remote command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_status: i32,
}

/// Counters of payload bytes moved over the session's channels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub commands_run: u64,
}
