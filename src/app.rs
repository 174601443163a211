//! Wiring from configuration to a ready [`VboxService`].

use crate::config::AppConfig;
use anyhow::{Context, Result};
use log::{info, warn};
use rbox_storage::{load_servers, Vault};
use rbox_vbox::{ServerParams, VboxService, VboxServiceState};
use secrecy::SecretString;
use std::sync::Arc;

/// Environment variable holding the vault passphrase.
pub const PASSPHRASE_ENV: &str = "RBOX_VAULT_PASSPHRASE";

/// Name of the server registered when the list is empty.
pub const LOCAL_SERVER: &str = "localhost";

pub struct App {
    pub config: AppConfig,
    pub service: VboxServiceState,
}

/// Vault from `RBOX_VAULT_PASSPHRASE`, if set.
pub fn vault_from_env() -> Option<Vault> {
    std::env::var(PASSPHRASE_ENV)
        .ok()
        .filter(|p| !p.is_empty())
        .map(|p| Vault::new(SecretString::new(p)))
}

impl App {
    /// Register every server from the configured list. An empty list
    /// registers this machine as `localhost`.
    pub async fn build(config: AppConfig, vault: Option<&Vault>) -> Result<Self> {
        let mut params = load_servers(&config.servers_file, vault)
            .with_context(|| format!("loading servers from {}", config.servers_file.display()))?;
        if params.is_empty() {
            warn!("No servers configured, using the local VBoxManage");
            params.push(ServerParams::local(LOCAL_SERVER));
        }

        let service = Arc::new(VboxService::new(config.vbox.clone()));
        for p in params {
            let name = p.name.clone();
            service
                .add_server(p)
                .await
                .with_context(|| format!("registering server '{}'", name))?;
        }
        info!("{} server(s) registered", service.servers().await.len());
        Ok(Self { config, service })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rbox_storage::{save_records, ServerRecord};

    fn config_in(dir: &std::path::Path) -> AppConfig {
        AppConfig {
            servers_file: dir.join("servers.json"),
            ..AppConfig::default()
        }
    }

    #[tokio::test]
    async fn empty_list_registers_localhost() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::build(config_in(dir.path()), None).await.unwrap();
        let servers = app.service.servers().await;
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].name(), LOCAL_SERVER);
        assert!(servers[0].params().is_local());
    }

    #[tokio::test]
    async fn servers_come_from_the_list() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        let mut lab = ServerRecord::local("lab");
        lab.host = "10.0.0.5".into();
        lab.user = "vbox".into();
        save_records(&config.servers_file, &[ServerRecord::local("here"), lab]).unwrap();

        let app = App::build(config, None).await.unwrap();
        let names: Vec<String> = app
            .service
            .servers()
            .await
            .iter()
            .map(|s| s.name().to_string())
            .collect();
        assert_eq!(names, vec!["here", "lab"]);
    }

    #[tokio::test]
    async fn duplicate_names_fail() {
        let dir = tempfile::tempdir().unwrap();
        let config = config_in(dir.path());
        save_records(
            &config.servers_file,
            &[ServerRecord::local("twin"), ServerRecord::local("twin")],
        )
        .unwrap();
        assert!(App::build(config, None).await.is_err());
    }
}
