//! # Application Configuration
//!
//! Settings for the `rbox` front end, stored as pretty JSON at
//! `<config_dir>/remotebox/config.json`. A missing file means defaults;
//! a present but unreadable one is an error.
//!
//! ```json
//! {
//!   "vbox": { "vboxmanagePath": "VBoxManage", "pollIntervalSeconds": 5 },
//!   "serversFile": "/home/me/.config/remotebox/servers.json",
//!   "logLevel": "info",
//!   "logJson": false
//! }
//! ```

use anyhow::{Context, Result};
use rbox_vbox::types::VboxConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const APP_DIR: &str = "remotebox";

/// `<config_dir>/remotebox`, or the working directory when the platform
/// has no config dir.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from("."))
}

pub fn default_config_path() -> PathBuf {
    config_dir().join("config.json")
}

fn default_servers_file() -> PathBuf {
    config_dir().join("servers.json")
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub vbox: VboxConfig,
    #[serde(default = "default_servers_file")]
    pub servers_file: PathBuf,
    /// Filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            vbox: VboxConfig::default(),
            servers_file: default_servers_file(),
            log_level: default_log_level(),
            log_json: false,
        }
    }
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config: AppConfig = serde_json::from_str(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)
                .with_context(|| format!("creating config dir: {}", dir.display()))?;
        }
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing config: {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            !self.vbox.vboxmanage_path.trim().is_empty(),
            "vbox.vboxmanagePath must not be empty"
        );
        anyhow::ensure!(
            self.vbox.transcript_capacity >= 1,
            "vbox.transcriptCapacity must be >= 1"
        );
        anyhow::ensure!(
            self.vbox.poll_interval_seconds >= 1,
            "vbox.pollIntervalSeconds must be >= 1"
        );
        Ok(())
    }
}
