//! Aggregate service facade for the VirtualBox management crate.
//!
//! Owns the registered servers and delegates to the domain managers.
//! Callers address servers by name (or id) and VMs by UUID (or name).

use crate::error::{VboxError, VboxResult};
use crate::machine::Machine;
use crate::poller::Poller;
use crate::projection::VmSummary;
use crate::reconcile::{self, ApplyReport};
use crate::server::{Server, ServerParams};
use crate::snapshot::SnapshotManager;
use crate::task::{Operation, Task};
use crate::types::*;
use crate::vm::{VmContext, VmManager, VmSetting};

use log::info;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Shared handle for front ends.
pub type VboxServiceState = Arc<VboxService>;

/// Central VirtualBox management service.
pub struct VboxService {
    config: VboxConfig,
    servers: RwLock<Vec<Arc<Server>>>,
}

impl Default for VboxService {
    fn default() -> Self {
        Self::new(VboxConfig::default())
    }
}

impl VboxService {
    pub fn new(config: VboxConfig) -> Self {
        Self {
            config,
            servers: RwLock::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &VboxConfig {
        &self.config
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Servers
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Register a server. Names must be unique.
    pub async fn add_server(&self, params: ServerParams) -> VboxResult<Arc<Server>> {
        let mut servers = self.servers.write().await;
        if servers.iter().any(|s| s.name() == params.name) {
            return Err(VboxError::conflict(format!(
                "A server named '{}' is already registered",
                params.name
            )));
        }
        let server = Arc::new(Server::new(params, self.config.clone()));
        servers.push(Arc::clone(&server));
        Ok(server)
    }

    /// Unregister a server, disconnecting it first.
    pub async fn remove_server(&self, key: &str) -> VboxResult<()> {
        let server = self.server(key).await?;
        if server.is_connected().await {
            server.disconnect().await?;
        }
        self.servers.write().await.retain(|s| s.id() != server.id());
        info!("Server {} removed", server.name());
        Ok(())
    }

    pub async fn servers(&self) -> Vec<Arc<Server>> {
        self.servers.read().await.clone()
    }

    pub async fn server(&self, key: &str) -> VboxResult<Arc<Server>> {
        self.servers
            .read()
            .await
            .iter()
            .find(|s| s.name() == key || s.id() == key)
            .cloned()
            .ok_or_else(|| VboxError::not_found("Server", key))
    }

    /// Connect and load the VM list. Returns the `VBoxManage` version.
    pub async fn connect(&self, server: &str) -> VboxResult<String> {
        let server = self.server(server).await?;
        let version = server.connect().await?;
        server.refresh_machines().await?;
        Ok(version)
    }

    pub async fn disconnect(&self, server: &str) -> VboxResult<()> {
        self.server(server).await?.disconnect().await
    }

    pub async fn version(&self, server: &str) -> VboxResult<String> {
        Ok(self.server(server).await?.version().await?.as_ref().clone())
    }

    /// Poll every VM of `server` at the configured interval.
    pub async fn start_poller(&self, server: &str) -> VboxResult<Poller> {
        let server = self.server(server).await?;
        let every = Duration::from_secs(self.config.poll_interval_seconds.max(1));
        Ok(Poller::spawn(server, every))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Host
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn os_types(&self, server: &str) -> VboxResult<Arc<Vec<OsType>>> {
        self.server(server).await?.os_types().await
    }

    pub async fn bridged_interfaces(&self, server: &str) -> VboxResult<Arc<Vec<HostInterface>>> {
        self.server(server).await?.bridged_interfaces().await
    }

    pub async fn host_only_interfaces(&self, server: &str) -> VboxResult<Arc<Vec<HostInterface>>> {
        self.server(server).await?.host_only_interfaces().await
    }

    pub async fn hard_disk_tree(&self, server: &str) -> VboxResult<Vec<MediumNode>> {
        self.server(server).await?.hard_disk_tree().await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  VMs
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Re-read `list vms` and return the VMs in listing order.
    pub async fn list_vms(&self, server: &str) -> VboxResult<Vec<Arc<Machine>>> {
        self.server(server).await?.refresh_machines().await
    }

    pub async fn vm(&self, server: &str, vm: &str) -> VboxResult<VmContext> {
        self.server(server).await?.context(vm).await
    }

    /// Refresh a VM and return its headline settings.
    pub async fn vm_summary(&self, server: &str, vm: &str) -> VboxResult<VmSummary> {
        let ctx = self.vm(server, vm).await?;
        ctx.refresh().await?;
        ctx.machine
            .summary()
            .await
            .ok_or_else(|| VboxError::not_found("VM state", vm))
    }

    pub async fn start_vm(&self, server: &str, vm: &str, mode: StartMode) -> VboxResult<Operation> {
        Ok(VmManager::start(&self.vm(server, vm).await?, mode))
    }

    pub async fn save_vm(&self, server: &str, vm: &str) -> VboxResult<Operation> {
        Ok(VmManager::save_state(&self.vm(server, vm).await?))
    }

    pub async fn shutdown_vm(&self, server: &str, vm: &str) -> VboxResult<Operation> {
        Ok(VmManager::acpi_shutdown(&self.vm(server, vm).await?))
    }

    pub async fn power_off_vm(&self, server: &str, vm: &str) -> VboxResult<Operation> {
        Ok(VmManager::power_off(&self.vm(server, vm).await?))
    }

    pub async fn pause_vm(&self, server: &str, vm: &str) -> VboxResult<Task<()>> {
        VmManager::pause(&self.vm(server, vm).await?).await
    }

    pub async fn resume_vm(&self, server: &str, vm: &str) -> VboxResult<Task<()>> {
        VmManager::resume(&self.vm(server, vm).await?).await
    }

    pub async fn modify_vm(&self, server: &str, vm: &str, settings: &[VmSetting]) -> VboxResult<Task<()>> {
        VmManager::modify(&self.vm(server, vm).await?, settings).await
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Snapshots
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn snapshots(&self, server: &str, vm: &str) -> VboxResult<Option<SnapshotNode>> {
        SnapshotManager::list(&self.vm(server, vm).await?).await
    }

    pub async fn take_snapshot(
        &self,
        server: &str,
        vm: &str,
        name: &str,
        description: Option<&str>,
    ) -> VboxResult<Operation> {
        Ok(SnapshotManager::take(&self.vm(server, vm).await?, name, description))
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    //  Child Collections
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    pub async fn storage(&self, server: &str, vm: &str) -> VboxResult<Vec<StorageController>> {
        let ctx = self.vm(server, vm).await?;
        if !ctx.machine.state().is_populated().await {
            ctx.refresh().await?;
        }
        Ok(ctx.machine.storage_controllers().await)
    }

    pub async fn apply_storage(
        &self,
        server: &str,
        vm: &str,
        desired: &[StorageController],
    ) -> VboxResult<ApplyReport> {
        reconcile::reconcile_storage(&self.vm(server, vm).await?, desired).await
    }

    pub async fn apply_usb_filters(&self, server: &str, vm: &str, desired: &[UsbFilter]) -> VboxResult<ApplyReport> {
        reconcile::reconcile_usb_filters(&self.vm(server, vm).await?, desired).await
    }

    pub async fn apply_shared_folders(
        &self,
        server: &str,
        vm: &str,
        desired: &[SharedFolder],
    ) -> VboxResult<ApplyReport> {
        reconcile::reconcile_shared_folders(&self.vm(server, vm).await?, desired).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VboxErrorKind;

    #[tokio::test]
    async fn server_names_are_unique() {
        let service = VboxService::default();
        service.add_server(ServerParams::local("lab")).await.unwrap();
        let err = service
            .add_server(ServerParams::local("lab"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::Conflict);
    }

    #[tokio::test]
    async fn unknown_server_is_not_found() {
        let service = VboxService::default();
        let err = service.version("nowhere").await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::NotFound);
    }

    #[tokio::test]
    async fn vm_on_disconnected_server_fails() {
        let service = VboxService::default();
        service.add_server(ServerParams::local("lab")).await.unwrap();
        let err = service.vm("lab", "web").await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn remove_server_by_id() {
        let service = VboxService::default();
        let server = service.add_server(ServerParams::local("lab")).await.unwrap();
        service.remove_server(server.id()).await.unwrap();
        assert!(service.servers().await.is_empty());
    }
}
