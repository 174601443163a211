//! Error types for the VirtualBox management crate.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Error kinds for VirtualBox operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VboxErrorKind {
    /// The local process or remote channel could not be started.
    TransportStart,
    /// `VBoxManage` exited non-zero; its output is in `details`.
    CommandFailed,
    /// The command exited cleanly but the expected completion marker is absent.
    MarkerMissing,
    /// The command printed something where silence means success.
    UnexpectedOutput,
    /// The server has no live transport.
    NotConnected,
    /// A value has no entry in the CLI mapping table.
    UnmappedValue,
    /// The desired configuration contradicts itself (e.g. duplicate names).
    Conflict,
    /// Parsed output references something that does not exist.
    Consistency,
    /// The requested server / VM / item is not known.
    NotFound,
    /// SSH session failure after the transport was established.
    Session,
    /// A local command exceeded its configured time limit.
    Timeout,
    /// The background task was dropped before it produced a result.
    Abandoned,
    /// A generic / uncategorised error.
    Other,
}

/// VirtualBox management error.
///
/// `details` holds the diagnostic output lines of the failed command, in
/// order, so callers can show the last line(s) to the user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VboxError {
    pub kind: VboxErrorKind,
    pub message: String,
    #[serde(default)]
    pub details: Vec<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

impl fmt::Display for VboxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:?}] {}", self.kind, self.message)?;
        if let Some(line) = self.last_diagnostic() {
            write!(f, ": {}", line)?;
        }
        Ok(())
    }
}

impl std::error::Error for VboxError {}

impl VboxError {
    pub fn new(kind: VboxErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: Vec::new(),
            exit_code: None,
        }
    }

    pub fn with_details(
        kind: VboxErrorKind,
        message: impl Into<String>,
        details: Vec<String>,
    ) -> Self {
        Self {
            kind,
            message: message.into(),
            details,
            exit_code: None,
        }
    }

    /// Attach diagnostic lines to an error built by another constructor.
    pub fn with_lines(mut self, lines: Vec<String>) -> Self {
        self.details = lines;
        self
    }

    pub fn transport_start(command: &str, cause: impl fmt::Display) -> Self {
        Self::with_details(
            VboxErrorKind::TransportStart,
            format!("Failed to start '{}'", command),
            vec![cause.to_string()],
        )
    }

    pub fn command_failed(command: &str, exit_code: i32, lines: Vec<String>) -> Self {
        Self {
            kind: VboxErrorKind::CommandFailed,
            message: format!("'{}' exited with code {}", command, exit_code),
            details: lines,
            exit_code: Some(exit_code),
        }
    }

    pub fn marker_missing(command: &str, marker: &str, lines: Vec<String>) -> Self {
        Self::with_details(
            VboxErrorKind::MarkerMissing,
            format!("'{}' did not report '{}'", command, marker),
            lines,
        )
    }

    pub fn unexpected_output(command: &str, lines: Vec<String>) -> Self {
        Self::with_details(
            VboxErrorKind::UnexpectedOutput,
            format!("'{}' produced unexpected output", command),
            lines,
        )
    }

    pub fn not_connected(server: &str) -> Self {
        Self::new(
            VboxErrorKind::NotConnected,
            format!("Server '{}' is not connected", server),
        )
    }

    pub fn unmapped(type_name: &str, value: &str) -> Self {
        Self::new(
            VboxErrorKind::UnmappedValue,
            format!("'{}' is not a valid {}", value, type_name),
        )
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::Conflict, message)
    }

    pub fn consistency(message: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::Consistency, message)
    }

    pub fn not_found(what: &str, key: &str) -> Self {
        Self::new(VboxErrorKind::NotFound, format!("{} '{}' not found", what, key))
    }

    pub fn session(message: impl Into<String>) -> Self {
        Self::new(VboxErrorKind::Session, message)
    }

    pub fn timeout(command: &str) -> Self {
        Self::new(
            VboxErrorKind::Timeout,
            format!("'{}' timed out", command),
        )
    }

    pub fn abandoned(label: &str) -> Self {
        Self::new(
            VboxErrorKind::Abandoned,
            format!("Task '{}' ended without a result", label),
        )
    }

    /// Last non-blank diagnostic line, if any.
    pub fn last_diagnostic(&self) -> Option<&str> {
        self.details
            .iter()
            .rev()
            .map(|l| l.trim())
            .find(|l| !l.is_empty())
    }

    /// Short message plus the last diagnostic line, for display to users.
    pub fn user_message(&self) -> String {
        match self.last_diagnostic() {
            Some(line) => format!("{}\n{}", self.message, line),
            None => self.message.clone(),
        }
    }

    /// Whether any diagnostic line contains `needle` (e.g. a `VBOX_E_*` code).
    pub fn mentions(&self, needle: &str) -> bool {
        self.details.iter().any(|l| l.contains(needle))
    }
}

/// Convert a `VboxError` into a plain `String` for front-end returns.
impl From<VboxError> for String {
    fn from(e: VboxError) -> String {
        e.to_string()
    }
}

/// Convenience alias.
pub type VboxResult<T> = Result<T, VboxError>;
