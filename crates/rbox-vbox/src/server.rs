//! A VirtualBox host: its connection, its own properties, lazily loaded
//! host-wide listings, and the VMs registered on it.

use crate::entity::{EntityState, RefreshOutcome};
use crate::error::{VboxError, VboxErrorKind, VboxResult};
use crate::machine::Machine;
use crate::parse::{
    media_tree, parse_colon_fields, parse_ext_packs, parse_host_interfaces, parse_media,
    parse_os_types, parse_usb_hosts, parse_version, parse_vm_list,
};
use crate::transport::{CommandOutput, CommandRunner, LiveOutput, Target, Transport};
use crate::types::{
    ExtensionPack, HostInterface, Medium, MediumNode, OsType, PropertyMap, UsbDevice, VboxConfig,
    VmListEntry,
};
use crate::vm::VmContext;
use log::{debug, info, warn};
use rbox_ssh::{SshParams, SshSession};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

// ─── Parameters ──────────────────────────────────────────────────────

/// How to reach a server. `remote: None` means this machine.
#[derive(Debug)]
pub struct ServerParams {
    pub name: String,
    pub remote: Option<Arc<SshParams>>,
    /// Overrides the configured `VBoxManage` path for this server.
    pub vboxmanage_path: Option<String>,
    /// Extra directories offered when picking disk images.
    pub image_dirs: Vec<String>,
}

impl ServerParams {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            remote: None,
            vboxmanage_path: None,
            image_dirs: Vec::new(),
        }
    }

    pub fn remote(name: impl Into<String>, ssh: SshParams) -> Self {
        Self {
            remote: Some(Arc::new(ssh)),
            ..Self::local(name)
        }
    }

    pub fn is_local(&self) -> bool {
        self.remote.is_none()
    }
}

// ─── Lazy Cache ──────────────────────────────────────────────────────

/// One lazily loaded value with its own lock.
pub struct Cached<T> {
    slot: Mutex<Option<Arc<T>>>,
}

impl<T> Default for Cached<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T> Cached<T> {
    /// Cached value, loading it first if absent. A failed load leaves the
    /// slot empty so the next call tries again.
    pub async fn get_or_load<F, Fut>(&self, load: F) -> VboxResult<Arc<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = VboxResult<T>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(value) = slot.as_ref() {
            return Ok(Arc::clone(value));
        }
        let value = Arc::new(load().await?);
        *slot = Some(Arc::clone(&value));
        Ok(value)
    }

    pub async fn set(&self, value: T) {
        *self.slot.lock().await = Some(Arc::new(value));
    }

    pub async fn peek(&self) -> Option<Arc<T>> {
        self.slot.lock().await.clone()
    }

    pub async fn invalidate(&self) {
        *self.slot.lock().await = None;
    }
}

#[derive(Default)]
struct HostCaches {
    version: Cached<String>,
    os_types: Cached<Vec<OsType>>,
    bridged: Cached<Vec<HostInterface>>,
    host_only: Cached<Vec<HostInterface>>,
    ext_packs: Cached<Vec<ExtensionPack>>,
    usb_hosts: Cached<Vec<UsbDevice>>,
    hdds: Cached<Vec<Medium>>,
    dvds: Cached<Vec<Medium>>,
    floppies: Cached<Vec<Medium>>,
}

// ─── Server ──────────────────────────────────────────────────────────

pub struct Server {
    id: String,
    params: ServerParams,
    config: VboxConfig,
    transport: RwLock<Option<Arc<Transport>>>,
    session: Mutex<Option<Arc<SshSession>>>,
    state: EntityState,
    caches: HostCaches,
    machines: RwLock<Vec<Arc<Machine>>>,
}

impl Server {
    pub fn new(params: ServerParams, config: VboxConfig) -> Self {
        let capacity = config.transcript_capacity;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            params,
            config,
            transport: RwLock::new(None),
            session: Mutex::new(None),
            state: EntityState::new(capacity),
            caches: HostCaches::default(),
            machines: RwLock::new(Vec::new()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.params.name
    }

    pub fn params(&self) -> &ServerParams {
        &self.params
    }

    pub fn state(&self) -> &EntityState {
        &self.state
    }

    fn program(&self) -> String {
        self.params
            .vboxmanage_path
            .clone()
            .unwrap_or_else(|| self.config.vboxmanage_path.clone())
    }

    // ── Connection ───────────────────────────────────────────────────

    /// Open the transport (an SSH session for remote servers) and check
    /// that `VBoxManage` answers. Returns its version. Any previous
    /// transport and session are closed first.
    pub async fn connect(&self) -> VboxResult<String> {
        if self.transport.write().await.take().is_some() {
            debug!("Server {} closing previous transport", self.params.name);
        }
        self.drop_session().await;

        let target = match &self.params.remote {
            None => Target::Local,
            Some(ssh) => {
                let ssh = Arc::clone(ssh);
                let label = ssh.display_target();
                info!("Connecting to {} ({})", self.params.name, label);
                let session = tokio::task::spawn_blocking(move || SshSession::connect(ssh))
                    .await
                    .map_err(|e| VboxError::session(format!("Connect task failed: {}", e)))?
                    .map_err(|e| VboxError::transport_start(&label, e))?;
                let session = Arc::new(session);
                *self.session.lock().await = Some(Arc::clone(&session));
                Target::Remote(session)
            }
        };
        self.connect_with_runner(target.runner(&self.config)).await
    }

    /// Use `runner` as this server's transport and check that `VBoxManage`
    /// answers.
    pub async fn connect_with_runner(&self, runner: Arc<dyn CommandRunner>) -> VboxResult<String> {
        let transport = Arc::new(Transport::new(runner, self.program()));
        let output = self
            .invoke_on(&transport, &["--version".to_string()], LiveOutput::none())
            .await;
        let version = match output.map(|o| parse_version(&o.lines)) {
            Ok(Some(version)) => version,
            Ok(None) => {
                self.drop_session().await;
                return Err(VboxError::new(
                    VboxErrorKind::UnexpectedOutput,
                    format!("'{} --version' printed no version", self.program()),
                ));
            }
            Err(e) => {
                self.drop_session().await;
                return Err(e);
            }
        };

        *self.transport.write().await = Some(transport);
        self.caches.version.set(version.clone()).await;
        info!("Server {} connected, VBoxManage {}", self.params.name, version);
        Ok(version)
    }

    async fn drop_session(&self) {
        if let Some(session) = self.session.lock().await.take() {
            let _ = tokio::task::spawn_blocking(move || session.disconnect()).await;
        }
    }

    /// Drop the transport. Cached state stays readable but goes stale.
    pub async fn disconnect(&self) -> VboxResult<()> {
        let was_connected = self.transport.write().await.take().is_some();
        self.drop_session().await;
        if !was_connected {
            return Err(VboxError::not_connected(&self.params.name));
        }
        info!("Server {} disconnected", self.params.name);
        Ok(())
    }

    pub async fn reconnect(&self) -> VboxResult<String> {
        let _ = self.disconnect().await;
        self.connect().await
    }

    pub async fn is_connected(&self) -> bool {
        self.transport.read().await.is_some()
    }

    pub async fn transport(&self) -> VboxResult<Arc<Transport>> {
        self.transport
            .read()
            .await
            .clone()
            .ok_or_else(|| VboxError::not_connected(&self.params.name))
    }

    /// Byte counters of the SSH session, if remote and connected.
    pub async fn transfer_stats(&self) -> Option<rbox_ssh::TransferStats> {
        self.session.lock().await.as_ref().map(|s| s.stats())
    }

    // ── Commands ─────────────────────────────────────────────────────

    /// Run a host-level command, keeping its transcript on the server.
    pub async fn invoke(&self, args: &[String]) -> VboxResult<CommandOutput> {
        self.invoke_live(args, LiveOutput::none()).await
    }

    /// Like [`invoke`](Self::invoke), streaming output into `live`.
    pub async fn invoke_live(&self, args: &[String], live: LiveOutput) -> VboxResult<CommandOutput> {
        let transport = self.transport().await?;
        self.invoke_on(&transport, args, live).await
    }

    async fn invoke_on(
        &self,
        transport: &Transport,
        args: &[String],
        live: LiveOutput,
    ) -> VboxResult<CommandOutput> {
        let output = match transport.run_live(args, live).await {
            Ok(output) => output,
            Err(e) => {
                self.state.record_failure(&args.join(" "), &e);
                return Err(e);
            }
        };
        self.state.record_output(&output);
        output.check_ok()?;
        Ok(output)
    }

    async fn lines(&self, args: &[&str]) -> VboxResult<Vec<String>> {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        Ok(self.invoke(&args).await?.lines)
    }

    // ── Server State ─────────────────────────────────────────────────

    async fn load_host(&self) -> VboxResult<PropertyMap> {
        let mut map = parse_colon_fields(&self.lines(&["list", "systemproperties"]).await?);
        map.extend(parse_colon_fields(&self.lines(&["list", "hostinfo"]).await?));
        Ok(map)
    }

    /// System properties and host info, merged.
    pub async fn refresh(&self) -> VboxResult<()> {
        self.state.refresh(|| self.load_host()).await
    }

    pub async fn try_refresh(&self) -> VboxResult<RefreshOutcome> {
        self.state.try_refresh(|| self.load_host()).await
    }

    pub async fn property(&self, key: &str) -> Option<String> {
        self.state.property(key).await
    }

    // ── Host Listings ────────────────────────────────────────────────

    pub async fn version(&self) -> VboxResult<Arc<String>> {
        self.caches
            .version
            .get_or_load(|| async {
                parse_version(&self.lines(&["--version"]).await?).ok_or_else(|| {
                    VboxError::new(
                        VboxErrorKind::UnexpectedOutput,
                        "VBoxManage printed no version",
                    )
                })
            })
            .await
    }

    pub async fn os_types(&self) -> VboxResult<Arc<Vec<OsType>>> {
        self.caches
            .os_types
            .get_or_load(|| async { Ok(parse_os_types(&self.lines(&["list", "ostypes"]).await?)) })
            .await
    }

    pub async fn bridged_interfaces(&self) -> VboxResult<Arc<Vec<HostInterface>>> {
        self.caches
            .bridged
            .get_or_load(|| async {
                Ok(parse_host_interfaces(&self.lines(&["list", "bridgedifs"]).await?))
            })
            .await
    }

    pub async fn host_only_interfaces(&self) -> VboxResult<Arc<Vec<HostInterface>>> {
        self.caches
            .host_only
            .get_or_load(|| async {
                Ok(parse_host_interfaces(&self.lines(&["list", "hostonlyifs"]).await?))
            })
            .await
    }

    pub async fn ext_packs(&self) -> VboxResult<Arc<Vec<ExtensionPack>>> {
        self.caches
            .ext_packs
            .get_or_load(|| async { Ok(parse_ext_packs(&self.lines(&["list", "extpacks"]).await?)) })
            .await
    }

    pub async fn usb_hosts(&self) -> VboxResult<Arc<Vec<UsbDevice>>> {
        self.caches
            .usb_hosts
            .get_or_load(|| async { Ok(parse_usb_hosts(&self.lines(&["list", "usbhost"]).await?)) })
            .await
    }

    pub async fn hard_disks(&self) -> VboxResult<Arc<Vec<Medium>>> {
        self.caches
            .hdds
            .get_or_load(|| async { Ok(parse_media(&self.lines(&["list", "hdds"]).await?)) })
            .await
    }

    /// Hard disks arranged by backing chain.
    pub async fn hard_disk_tree(&self) -> VboxResult<Vec<MediumNode>> {
        media_tree(&self.hard_disks().await?)
    }

    pub async fn dvds(&self) -> VboxResult<Arc<Vec<Medium>>> {
        self.caches
            .dvds
            .get_or_load(|| async { Ok(parse_media(&self.lines(&["list", "dvds"]).await?)) })
            .await
    }

    pub async fn floppies(&self) -> VboxResult<Arc<Vec<Medium>>> {
        self.caches
            .floppies
            .get_or_load(|| async { Ok(parse_media(&self.lines(&["list", "floppies"]).await?)) })
            .await
    }

    /// Forget every host listing; they reload on next access.
    pub async fn invalidate_caches(&self) {
        let c = &self.caches;
        c.version.invalidate().await;
        c.os_types.invalidate().await;
        c.bridged.invalidate().await;
        c.host_only.invalidate().await;
        c.ext_packs.invalidate().await;
        c.usb_hosts.invalidate().await;
        self.invalidate_media().await;
    }

    pub async fn invalidate_media(&self) {
        self.caches.hdds.invalidate().await;
        self.caches.dvds.invalidate().await;
        self.caches.floppies.invalidate().await;
    }

    // ── Machines ─────────────────────────────────────────────────────

    /// Reconcile the VM collection with `list vms`: new VMs are added,
    /// vanished ones dropped, known ones kept with their state.
    pub async fn refresh_machines(&self) -> VboxResult<Vec<Arc<Machine>>> {
        let listed = parse_vm_list(&self.lines(&["list", "vms"]).await?);
        Ok(self.apply_listing(listed).await)
    }

    async fn apply_listing(&self, listed: Vec<VmListEntry>) -> Vec<Arc<Machine>> {
        let mut machines = self.machines.write().await;
        let mut known: HashMap<String, Arc<Machine>> = machines
            .drain(..)
            .map(|m| (m.uuid().to_string(), m))
            .collect();

        let mut next = Vec::with_capacity(listed.len());
        for entry in listed {
            match known.remove(&entry.uuid) {
                Some(machine) => {
                    machine.set_listed_name(&entry.name);
                    next.push(machine);
                }
                None => {
                    debug!("Discovered VM {} ({})", entry.name, entry.uuid);
                    next.push(Arc::new(Machine::new(
                        entry.uuid,
                        entry.name,
                        self.config.transcript_capacity,
                    )));
                }
            }
        }
        for gone in known.values() {
            debug!("VM {} no longer registered", gone.uuid());
        }

        *machines = next.clone();
        next
    }

    pub async fn machines(&self) -> Vec<Arc<Machine>> {
        self.machines.read().await.clone()
    }

    /// Find a VM by UUID, or by name when no UUID matches.
    pub async fn machine(&self, key: &str) -> VboxResult<Arc<Machine>> {
        let machines = self.machines.read().await;
        if let Some(m) = machines.iter().find(|m| m.uuid() == key) {
            return Ok(Arc::clone(m));
        }
        let named: Vec<_> = machines.iter().filter(|m| m.listed_name() == key).collect();
        match named.as_slice() {
            [one] => Ok(Arc::clone(one)),
            [] => Err(VboxError::not_found("VM", key)),
            _ => {
                warn!("VM name '{}' is ambiguous on {}", key, self.params.name);
                Err(VboxError::conflict(format!(
                    "Several VMs are named '{}'; use the UUID",
                    key
                )))
            }
        }
    }

    /// Transport and VM bundled for the mutators.
    pub async fn context(&self, key: &str) -> VboxResult<VmContext> {
        let transport = self.transport().await?;
        if self.machines.read().await.is_empty() {
            self.refresh_machines().await?;
        }
        let machine = match self.machine(key).await {
            Ok(m) => m,
            Err(e) if e.kind == VboxErrorKind::NotFound => {
                self.refresh_machines().await?;
                self.machine(key).await?
            }
            Err(e) => return Err(e),
        };
        Ok(VmContext::new(transport, machine))
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("id", &self.id)
            .field("name", &self.params.name)
            .field("local", &self.params.is_local())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VboxErrorKind;
    use crate::testing::ScriptedRunner;

    async fn connected() -> (Arc<ScriptedRunner>, Server) {
        let runner = ScriptedRunner::new();
        runner.respond("--version", 0, "7.0.12r159484\n");
        let server = Server::new(ServerParams::local("lab"), VboxConfig::default());
        server.connect_with_runner(runner.clone()).await.unwrap();
        (runner, server)
    }

    #[tokio::test]
    async fn not_connected_until_connect() {
        let server = Server::new(ServerParams::local("lab"), VboxConfig::default());
        let err = server.invoke(&["list".into(), "vms".into()]).await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::NotConnected);
        assert!(server.disconnect().await.is_err());
    }

    #[tokio::test]
    async fn connect_reads_version_and_caches_it() {
        let (runner, server) = connected().await;
        assert!(server.is_connected().await);
        assert_eq!(server.version().await.unwrap().as_str(), "7.0.12r159484");
        assert_eq!(runner.count("--version"), 1);
    }

    #[tokio::test]
    async fn connect_releases_previous_transport() {
        let old = ScriptedRunner::new();
        old.respond("--version", 0, "7.0.12r159484\n");
        let mut params = ServerParams::local("lab");
        params.vboxmanage_path = Some("/nonexistent/VBoxManage-missing".into());
        let server = Server::new(params, VboxConfig::default());
        server.connect_with_runner(old.clone()).await.unwrap();
        assert!(server.is_connected().await);
        let issued = old.issued().len();

        let err = server.connect().await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::TransportStart);
        assert!(!server.is_connected().await);
        assert!(server.transfer_stats().await.is_none());
        assert_eq!(old.issued().len(), issued);
    }

    #[tokio::test]
    async fn connect_fails_without_version() {
        let runner = ScriptedRunner::new();
        runner.respond("--version", 0, "bash: VBoxManage: command not found\n");
        let server = Server::new(ServerParams::local("lab"), VboxConfig::default());
        let err = server.connect_with_runner(runner).await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::UnexpectedOutput);
        assert!(!server.is_connected().await);
    }

    #[tokio::test]
    async fn machine_collection_tracks_listing() {
        let (runner, server) = connected().await;
        runner.respond_once("list vms", 0, "\"a\" {1}\n\"b\" {2}\n");
        let first = server.refresh_machines().await.unwrap();
        assert_eq!(first.len(), 2);

        runner.respond_once("list vms", 0, "\"b renamed\" {2}\n\"c\" {3}\n");
        let second = server.refresh_machines().await.unwrap();
        assert_eq!(second.len(), 2);
        assert!(Arc::ptr_eq(&first[1], &second[0]));
        assert_eq!(second[0].listed_name(), "b renamed");
        assert!(server.machine("1").await.is_err());
        assert_eq!(server.machine("c").await.unwrap().uuid(), "3");
    }

    #[tokio::test]
    async fn ambiguous_name_is_a_conflict() {
        let (runner, server) = connected().await;
        runner.respond("list vms", 0, "\"twin\" {1}\n\"twin\" {2}\n");
        server.refresh_machines().await.unwrap();
        let err = server.machine("twin").await.unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::Conflict);
        assert_eq!(server.machine("2").await.unwrap().uuid(), "2");
    }

    #[tokio::test]
    async fn host_state_merges_two_listings() {
        let (runner, server) = connected().await;
        runner.respond("list systemproperties", 0, "API version: 7_0\n");
        runner.respond("list hostinfo", 0, "Processor count: 16\n");
        server.refresh().await.unwrap();
        assert_eq!(server.property("API version").await.as_deref(), Some("7_0"));
        assert_eq!(server.property("Processor count").await.as_deref(), Some("16"));
    }

    #[tokio::test]
    async fn listings_load_once_until_invalidated() {
        let (runner, server) = connected().await;
        runner.respond("list ostypes", 0, "ID: Linux26_64\nDescription: Linux 2.6 (64-bit)\n");
        server.os_types().await.unwrap();
        server.os_types().await.unwrap();
        assert_eq!(runner.count("list ostypes"), 1);
        server.invalidate_caches().await;
        assert_eq!(server.os_types().await.unwrap().len(), 1);
        assert_eq!(runner.count("list ostypes"), 2);
    }

    #[tokio::test]
    async fn failed_listing_is_retried_next_time() {
        let (runner, server) = connected().await;
        runner.respond_once("list extpacks", 1, "");
        assert!(server.ext_packs().await.is_err());
        assert!(server.ext_packs().await.unwrap().is_empty());
        assert_eq!(runner.count("list extpacks"), 2);
    }
}
