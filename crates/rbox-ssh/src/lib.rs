//! # RemoteBox – SSH
//!
//! Remote shell sessions used to run `VBoxManage` on another host:
//! connection setup, authentication (key file, password,
//! keyboard-interactive), command execution with split stdout/stderr
//! capture and live streaming, and transfer counters.

pub mod error;
pub mod types;
pub mod session;

pub use error::{SshError, SshResult};
pub use session::SshSession;
pub use types::{ExecOutput, OutputStream, SshParams, TransferStats, DEFAULT_SSH_PORT};
