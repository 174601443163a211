//! Storage controllers, attachments and registered media.
//!
//! The argument builders are plain functions so the reconciler can plan
//! with them before anything runs.

use crate::error::{VboxError, VboxErrorKind, VboxResult};
use crate::parse::COMPLETE_MARKER;
use crate::server::Server;
use crate::task::Task;
use crate::transport::Args;
use crate::types::{on_off, MediumFormat, MediumKind, StorageController, StorageMedium};
use crate::vm::{mutate, Check, VmContext};
use lazy_static::lazy_static;
use log::info;
use regex::Regex;
use std::sync::Arc;

lazy_static! {
    static ref CREATED_UUID: Regex =
        Regex::new(r"UUID:\s*([0-9A-Fa-f-]{36})").expect("valid medium uuid regex");
}

// ─── storagectl ──────────────────────────────────────────────────────

/// Fails for a controller whose type is not known, since `--add` needs
/// the bus it sits on.
pub fn controller_add_args(uuid: &str, ctl: &StorageController) -> VboxResult<Args> {
    let Some(chipset) = ctl.chipset else {
        return Err(VboxError::unmapped("storage controller chipset", ctl.type_label()));
    };
    let args = Args::new("storagectl")
        .arg(uuid)
        .flag("--name", &ctl.name)
        .flag("--add", chipset.bus().as_cli())
        .flag("--controller", chipset.as_cli())
        .flag("--bootable", on_off(ctl.bootable));
    Ok(with_port_count(args, ctl))
}

pub fn controller_remove_args(uuid: &str, name: &str) -> Args {
    Args::new("storagectl").arg(uuid).flag("--name", name).arg("--remove")
}

pub fn controller_rename_args(uuid: &str, from: &str, to: &str) -> Args {
    Args::new("storagectl")
        .arg(uuid)
        .flag("--name", from)
        .flag("--rename", to)
}

/// Chipset, bootable flag and port count of an existing controller. An
/// unknown chipset is left as it is on the host.
pub fn controller_modify_args(uuid: &str, ctl: &StorageController) -> Args {
    let mut args = Args::new("storagectl").arg(uuid).flag("--name", &ctl.name);
    if let Some(chipset) = ctl.chipset {
        args = args.flag("--controller", chipset.as_cli());
    }
    with_port_count(args.flag("--bootable", on_off(ctl.bootable)), ctl)
}

fn with_port_count(args: Args, ctl: &StorageController) -> Args {
    match ctl.port_count {
        Some(n) => args.flag("--portcount", n),
        None => args,
    }
}

// ─── storageattach ───────────────────────────────────────────────────

pub fn attach_args(uuid: &str, controller: &str, medium: &StorageMedium) -> Args {
    let args = Args::new("storageattach")
        .arg(uuid)
        .flag("--storagectl", controller)
        .flag("--port", medium.port)
        .flag("--device", medium.device)
        .flag("--type", medium.kind.as_cli())
        .flag("--medium", medium.medium_argument());
    match medium.kind {
        MediumKind::Hdd => args
            .flag("--nonrotational", on_off(medium.nonrotational))
            .flag("--discard", on_off(medium.discard))
            .flag("--hotpluggable", on_off(medium.hot_pluggable)),
        MediumKind::Dvd => args
            .flag("--tempeject", on_off(medium.temp_eject))
            .flag("--hotpluggable", on_off(medium.hot_pluggable)),
        MediumKind::Floppy => args,
    }
}

pub fn detach_args(uuid: &str, controller: &str, port: u32, device: u32) -> Args {
    Args::new("storageattach")
        .arg(uuid)
        .flag("--storagectl", controller)
        .flag("--port", port)
        .flag("--device", device)
        .flag("--medium", "none")
}

// ─── Storage Manager ─────────────────────────────────────────────────

/// Storage changes to one VM. Each refreshes the VM on success.
pub struct StorageManager;

impl StorageManager {
    pub async fn add_controller(ctx: &VmContext, ctl: &StorageController) -> VboxResult<Task<()>> {
        info!("Adding controller '{}' to VM {}", ctl.name, ctx.uuid());
        mutate(ctx, controller_add_args(ctx.uuid(), ctl)?, Check::Silent).await
    }

    pub async fn remove_controller(ctx: &VmContext, name: &str) -> VboxResult<Task<()>> {
        info!("Removing controller '{}' from VM {}", name, ctx.uuid());
        mutate(ctx, controller_remove_args(ctx.uuid(), name), Check::Silent).await
    }

    pub async fn rename_controller(ctx: &VmContext, from: &str, to: &str) -> VboxResult<Task<()>> {
        mutate(ctx, controller_rename_args(ctx.uuid(), from, to), Check::Silent).await
    }

    pub async fn modify_controller(ctx: &VmContext, ctl: &StorageController) -> VboxResult<Task<()>> {
        mutate(ctx, controller_modify_args(ctx.uuid(), ctl), Check::Silent).await
    }

    pub async fn set_host_io_cache(ctx: &VmContext, controller: &str, on: bool) -> VboxResult<Task<()>> {
        let args = Args::new("storagectl")
            .arg(ctx.uuid())
            .flag("--name", controller)
            .flag("--hostiocache", on_off(on));
        mutate(ctx, args, Check::Silent).await
    }

    pub async fn attach(ctx: &VmContext, controller: &str, medium: &StorageMedium) -> VboxResult<Task<()>> {
        info!(
            "Attaching {} at {}:{}:{} on VM {}",
            medium.medium_argument(),
            controller,
            medium.port,
            medium.device,
            ctx.uuid()
        );
        mutate(ctx, attach_args(ctx.uuid(), controller, medium), Check::Silent).await
    }

    pub async fn detach(ctx: &VmContext, controller: &str, port: u32, device: u32) -> VboxResult<Task<()>> {
        info!("Detaching {}:{}:{} on VM {}", controller, port, device, ctx.uuid());
        mutate(ctx, detach_args(ctx.uuid(), controller, port, device), Check::Silent).await
    }
}

// ─── Media ───────────────────────────────────────────────────────────

/// Registered media on a server. Each clears the server's media listings
/// on success.
pub struct MediaManager;

impl MediaManager {
    /// `createmedium disk`; resolves to the new medium's UUID.
    pub fn create_disk(server: &Arc<Server>, path: &str, size_mb: u64, format: MediumFormat) -> Task<String> {
        info!("Creating {} disk {} ({} MB) on {}", format, path, size_mb, server.name());
        let args = Args::new("createmedium")
            .arg("disk")
            .flag_eq("--filename", path)
            .flag_eq("--size", size_mb)
            .flag_eq("--format", format.as_cli());
        let server = Arc::clone(server);
        Task::spawn(format!("create {}", path), move |reporter| async move {
            let output = server
                .invoke_live(args.as_slice(), reporter.track_output())
                .await?;
            let uuid = output
                .lines
                .iter()
                .find_map(|l| CREATED_UUID.captures(l).map(|c| c[1].to_string()))
                .ok_or_else(|| {
                    VboxError::with_details(
                        VboxErrorKind::MarkerMissing,
                        "createmedium did not report the new UUID",
                        output.lines.clone(),
                    )
                })?;
            server.invalidate_media().await;
            Ok(uuid)
        })
    }

    /// `closemedium <target> [--delete]`.
    pub async fn close(server: &Server, kind: MediumKind, target: &str, delete: bool) -> VboxResult<()> {
        info!("Closing medium {} on {} (delete: {})", target, server.name(), delete);
        let family = match kind {
            MediumKind::Hdd => "disk",
            MediumKind::Dvd => "dvd",
            MediumKind::Floppy => "floppy",
        };
        let args = Args::new("closemedium")
            .arg(family)
            .arg(target)
            .switch("--delete", delete);
        let output = server.invoke(args.as_slice()).await;
        server.invalidate_media().await;
        output?;
        Ok(())
    }

    pub fn compact(server: &Arc<Server>, target: &str) -> Task<()> {
        let args = Args::new("modifymedium").arg(target).arg("--compact");
        Self::modify(server, format!("compact {}", target), args)
    }

    pub fn resize(server: &Arc<Server>, target: &str, size_mb: u64) -> Task<()> {
        let args = Args::new("modifymedium").arg(target).flag("--resize", size_mb);
        Self::modify(server, format!("resize {}", target), args)
    }

    fn modify(server: &Arc<Server>, label: String, args: Args) -> Task<()> {
        info!("{} on {}", label, server.name());
        let server = Arc::clone(server);
        Task::spawn(label, move |reporter| async move {
            server
                .invoke_live(args.as_slice(), reporter.track_output())
                .await?
                .check_marker(&COMPLETE_MARKER)?;
            server.invalidate_media().await;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use crate::server::ServerParams;
    use crate::testing::ScriptedRunner;
    use crate::transport::Transport;
    use crate::types::{StorageChipset, VboxConfig};

    fn line(args: Args) -> String {
        args.into_vec().join(" ")
    }

    #[test]
    fn controller_commands() {
        let mut ctl = StorageController::new("SATA", StorageChipset::IntelAhci);
        ctl.port_count = Some(4);
        assert_eq!(
            line(controller_add_args("u1", &ctl).unwrap()),
            "storagectl u1 --name SATA --add sata --controller IntelAHCI --bootable on --portcount 4"
        );
        assert_eq!(
            line(controller_rename_args("u1", "SATA", "Disks")),
            "storagectl u1 --name SATA --rename Disks"
        );
        assert_eq!(line(controller_remove_args("u1", "IDE")), "storagectl u1 --name IDE --remove");
    }

    #[test]
    fn unknown_controller_type_is_never_sent() {
        let mut ctl = StorageController::unrecognised("Fibre", "FibreChannel");
        ctl.bootable = false;
        let err = controller_add_args("u1", &ctl).unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::UnmappedValue);
        assert_eq!(
            line(controller_modify_args("u1", &ctl)),
            "storagectl u1 --name Fibre --bootable off"
        );
    }

    #[test]
    fn attachment_flags_follow_medium_kind() {
        let mut disk = StorageMedium::new(0, 0, MediumKind::Hdd, Some("/vms/a.vdi".into()));
        disk.nonrotational = true;
        assert_eq!(
            line(attach_args("u1", "SATA", &disk)),
            "storageattach u1 --storagectl SATA --port 0 --device 0 --type hdd --medium /vms/a.vdi \
             --nonrotational on --discard off --hotpluggable off"
        );

        let drive = StorageMedium::new(1, 0, MediumKind::Dvd, None);
        assert_eq!(
            line(attach_args("u1", "IDE", &drive)),
            "storageattach u1 --storagectl IDE --port 1 --device 0 --type dvddrive --medium emptydrive \
             --tempeject off --hotpluggable off"
        );
        assert_eq!(
            line(detach_args("u1", "IDE", 1, 0)),
            "storageattach u1 --storagectl IDE --port 1 --device 0 --medium none"
        );
    }

    #[tokio::test]
    async fn attach_refreshes_vm() {
        let runner = ScriptedRunner::new();
        let transport = Arc::new(Transport::new(runner.clone(), "VBoxManage"));
        let ctx = VmContext::new(transport, Arc::new(Machine::new("u1", "web", 8)));
        let disk = StorageMedium::new(0, 0, MediumKind::Hdd, Some("/vms/a.vdi".into()));
        StorageManager::attach(&ctx, "SATA", &disk)
            .await
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(runner.count("storageattach"), 1);
        assert_eq!(runner.count("showvminfo u1"), 1);
    }

    #[tokio::test]
    async fn create_disk_returns_uuid() {
        let runner = ScriptedRunner::new();
        runner.respond("--version", 0, "7.0.12r159484\n");
        runner.respond(
            "createmedium",
            0,
            "0%...10%...100%\nMedium created. UUID: 0c9e3d35-5d2b-4d3a-8a5e-8d3c2f1e0b7a\n",
        );
        let server = Arc::new(Server::new(ServerParams::local("lab"), VboxConfig::default()));
        server.connect_with_runner(runner.clone()).await.unwrap();

        let uuid = MediaManager::create_disk(&server, "/vms/b.vdi", 2048, MediumFormat::Vdi)
            .wait()
            .await
            .unwrap();
        assert_eq!(uuid, "0c9e3d35-5d2b-4d3a-8a5e-8d3c2f1e0b7a");
        assert!(runner
            .issued_lines()
            .contains(&"createmedium disk --filename=/vms/b.vdi --size=2048 --format=VDI".to_string()));
    }
}
