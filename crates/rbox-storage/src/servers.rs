//! The persisted server list.
//!
//! A JSON array of records. Unknown keys are kept so a round trip through
//! this crate does not lose fields other tools wrote.

use crate::error::{StorageError, StorageResult};
use crate::vault::Vault;
use log::{debug, info};
use rbox_ssh::{SshParams, DEFAULT_SSH_PORT};
use rbox_vbox::ServerParams;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRecord {
    pub name: String,
    /// Empty means this machine.
    #[serde(default)]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    /// Vault blob holding the password, or the key passphrase when
    /// `keyfile` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pass: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyfile: Option<String>,
    /// `VBoxManage` path on that server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vboxmanage: Option<String>,
    #[serde(default, rename = "imagedirs", skip_serializing_if = "Vec::is_empty")]
    pub image_dirs: Vec<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl ServerRecord {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: String::new(),
            port: DEFAULT_SSH_PORT,
            user: String::new(),
            pass: None,
            keyfile: None,
            vboxmanage: None,
            image_dirs: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.host.trim().is_empty()
    }

    /// Connection parameters, decrypting the stored secret with `vault`.
    pub fn to_params(&self, vault: Option<&Vault>) -> StorageResult<ServerParams> {
        let mut params = if self.is_local() {
            ServerParams::local(&self.name)
        } else {
            let mut ssh = SshParams::new(self.host.trim(), &self.user).with_port(self.port);
            if let Some(key) = self.keyfile.as_deref().filter(|k| !k.is_empty()) {
                ssh = ssh.with_key_file(key);
            }
            if let Some(blob) = self.pass.as_deref().filter(|p| !p.is_empty()) {
                let vault = vault.ok_or_else(|| StorageError::VaultLocked(self.name.clone()))?;
                ssh = ssh.with_secret(vault.decrypt(blob)?);
            }
            ServerParams::remote(&self.name, ssh)
        };
        params.vboxmanage_path = self.vboxmanage.clone().filter(|p| !p.is_empty());
        params.image_dirs = self.image_dirs.clone();
        Ok(params)
    }
}

/// Read the server list. A missing file is an empty list.
pub fn load_records(path: &Path) -> StorageResult<Vec<ServerRecord>> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!("No server list at {}", path.display());
            return Ok(Vec::new());
        }
        Err(source) => {
            return Err(StorageError::Io {
                path: path.display().to_string(),
                source,
            })
        }
    };
    let records: Vec<ServerRecord> =
        serde_json::from_str(&text).map_err(|source| StorageError::Json {
            path: path.display().to_string(),
            source,
        })?;
    info!("Loaded {} server(s) from {}", records.len(), path.display());
    Ok(records)
}

pub fn save_records(path: &Path, records: &[ServerRecord]) -> StorageResult<()> {
    let io_err = |source| StorageError::Io {
        path: path.display().to_string(),
        source,
    };
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(io_err)?;
    }
    let json = serde_json::to_string_pretty(records).map_err(|source| StorageError::Json {
        path: path.display().to_string(),
        source,
    })?;
    fs::write(path, json).map_err(io_err)?;
    debug!("Saved {} server(s) to {}", records.len(), path.display());
    Ok(())
}

/// Load the list and turn every record into connection parameters.
pub fn load_servers(path: &Path, vault: Option<&Vault>) -> StorageResult<Vec<ServerParams>> {
    load_records(path)?
        .iter()
        .map(|r| r.to_params(vault))
        .collect()
}
