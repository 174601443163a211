//! VM mutators: lifecycle, `modifyvm` settings, export / clone / unregister.
//!
//! Every mutator runs one `VBoxManage` command, checks its outcome, and
//! only then schedules a refresh of the VM. Short commands return the
//! refresh as a [`Task`]; long ones return an [`Operation`] whose
//! `command` task resolves when the tool is done and whose `settled` task
//! resolves after the refresh.

use crate::error::{VboxError, VboxErrorKind, VboxResult};
use crate::machine::Machine;
use crate::parse::{COMPLETE_MARKER, STARTED_MARKER};
use crate::server::Server;
use crate::task::{task, Operation, Task};
use crate::transport::{Args, CommandOutput, LiveOutput, Transport};
use crate::types::{
    on_off, BootDevice, Chipset, ClipboardMode, DragAndDropMode, FirmwareType,
    GraphicsController, NicAttachment, NicType, ParavirtProvider, PromiscPolicy, RunState,
    StartMode, UsbControllerKind,
};
use log::{debug, info};
use regex::Regex;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How often the VM is re-read while waiting for an ACPI shutdown.
pub const ACPI_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How long a guest gets to power off after the ACPI button.
pub const ACPI_SHUTDOWN_LIMIT: Duration = Duration::from_secs(300);

// ─── Context ─────────────────────────────────────────────────────────

/// The transport and VM a mutator works on.
#[derive(Clone)]
pub struct VmContext {
    pub transport: Arc<Transport>,
    pub machine: Arc<Machine>,
}

impl VmContext {
    pub fn new(transport: Arc<Transport>, machine: Arc<Machine>) -> Self {
        Self { transport, machine }
    }

    pub fn uuid(&self) -> &str {
        self.machine.uuid()
    }

    pub async fn refresh(&self) -> VboxResult<()> {
        self.machine.refresh(&self.transport).await
    }
}

impl fmt::Debug for VmContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmContext")
            .field("uuid", &self.uuid())
            .field("name", &self.machine.listed_name())
            .field("target", &self.transport.describe())
            .finish()
    }
}

/// How a command proves it worked, beyond a zero exit.
#[derive(Clone, Copy)]
pub enum Check {
    Exit,
    /// Nothing printed at all.
    Silent,
    Marker(&'static Regex),
}

impl Check {
    pub fn verify(self, output: &CommandOutput) -> VboxResult<()> {
        match self {
            Check::Exit => output.check_ok(),
            Check::Silent => output.check_silent(),
            Check::Marker(re) => output.check_marker(re),
        }
    }
}

/// Run a command against the VM and verify it.
pub async fn run_checked(ctx: &VmContext, args: &Args, check: Check) -> VboxResult<CommandOutput> {
    let output = ctx.machine.invoke(&ctx.transport, args.as_slice()).await?;
    check.verify(&output)?;
    Ok(output)
}

/// Refresh the VM in the background.
pub fn spawn_refresh(ctx: &VmContext) -> Task<()> {
    let ctx = ctx.clone();
    Task::spawn(format!("refresh {}", ctx.uuid()), move |_| async move {
        ctx.refresh().await
    })
}

/// Run a short command; on success schedule a refresh and return it.
pub async fn mutate(ctx: &VmContext, args: Args, check: Check) -> VboxResult<Task<()>> {
    run_checked(ctx, &args, check).await?;
    Ok(spawn_refresh(ctx))
}

/// Run a long command in the background with progress tracking.
pub fn long_operation(ctx: &VmContext, label: impl Into<String>, args: Args, check: Check) -> Operation {
    long_operation_then(ctx, label, args, check, |ctx| async move { ctx.refresh().await })
}

/// Like [`long_operation`], with `settle` deciding when `settled` resolves.
pub fn long_operation_then<F, Fut>(
    ctx: &VmContext,
    label: impl Into<String>,
    args: Args,
    check: Check,
    settle: F,
) -> Operation
where
    F: FnOnce(VmContext) -> Fut + Send + 'static,
    Fut: Future<Output = VboxResult<()>> + Send + 'static,
{
    let label = label.into();
    let (command_done, command) = task(label.clone());
    let (settle_done, settled) = task(format!("{} (refresh)", label));
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let live = command_done.reporter().track_output();
        let result = run_live_checked(&ctx, &args, live, check).await;
        match result {
            Ok(()) => {
                command_done.complete(Ok(()));
                settle_done.complete(settle(ctx).await);
            }
            Err(e) => {
                command_done.complete(Err(e.clone()));
                settle_done.complete(Err(e));
            }
        }
    });

    Operation { command, settled }
}

/// Refresh every `poll` until the VM is no longer running or paused.
async fn wait_powered_off(ctx: VmContext, poll: Duration, limit: Duration) -> VboxResult<()> {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        ctx.refresh().await?;
        let state = ctx.machine.run_state().await;
        if matches!(state, RunState::Off | RunState::Saved | RunState::Aborted) {
            return Ok(());
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(VboxError::timeout(&format!("acpi shutdown of {}", ctx.uuid())));
        }
        debug!("VM {} still {:?} after ACPI shutdown request", ctx.uuid(), state);
        tokio::time::sleep(poll).await;
    }
}

async fn run_live_checked(ctx: &VmContext, args: &Args, live: LiveOutput, check: Check) -> VboxResult<()> {
    let output = ctx
        .machine
        .invoke_live(&ctx.transport, args.as_slice(), live)
        .await?;
    check.verify(&output)
}

// ─── Settings ────────────────────────────────────────────────────────

/// One `modifyvm` change.
#[derive(Debug, Clone, PartialEq)]
pub enum VmSetting {
    Name(String),
    OsType(String),
    Description(String),
    Cpus(u32),
    MemoryMb(u32),
    VramMb(u32),
    Firmware(FirmwareType),
    Chipset(Chipset),
    Graphics(GraphicsController),
    Paravirt(ParavirtProvider),
    Clipboard(ClipboardMode),
    DragAndDrop(DragAndDropMode),
    Ioapic(bool),
    Pae(bool),
    NestedPaging(bool),
    Boot { slot: u8, device: BootDevice },
    NicAttachment { slot: u8, attachment: NicAttachment },
    NicType { slot: u8, kind: NicType },
    NicPromisc { slot: u8, policy: PromiscPolicy },
    NicCable { slot: u8, connected: bool },
    BridgeAdapter { slot: u8, adapter: String },
    HostOnlyAdapter { slot: u8, adapter: String },
    InternalNetwork { slot: u8, network: String },
    MacAddress { slot: u8, mac: String },
    Usb { controller: UsbControllerKind, enabled: bool },
    Audio(bool),
}

const NIC_SLOTS: std::ops::RangeInclusive<u8> = 1..=8;
const BOOT_SLOTS: std::ops::RangeInclusive<u8> = 1..=4;

fn slot(range: std::ops::RangeInclusive<u8>, slot: u8, what: &str) -> VboxResult<u8> {
    if range.contains(&slot) {
        Ok(slot)
    } else {
        Err(VboxError::new(
            VboxErrorKind::Other,
            format!("{} slot {} is outside {:?}", what, slot, range),
        ))
    }
}

impl VmSetting {
    /// Append this change's flags to a `modifyvm` command.
    pub fn append_to(&self, args: Args) -> VboxResult<Args> {
        Ok(match self {
            VmSetting::Name(v) => args.flag("--name", v),
            VmSetting::OsType(v) => args.flag("--ostype", v),
            VmSetting::Description(v) => args.flag("--description", v),
            VmSetting::Cpus(n) => args.flag("--cpus", n),
            VmSetting::MemoryMb(n) => args.flag("--memory", n),
            VmSetting::VramMb(n) => args.flag("--vram", n),
            VmSetting::Firmware(v) => args.flag("--firmware", v.as_cli()),
            VmSetting::Chipset(v) => args.flag("--chipset", v.as_cli()),
            VmSetting::Graphics(v) => args.flag("--graphicscontroller", v.as_cli()),
            VmSetting::Paravirt(v) => args.flag("--paravirtprovider", v.as_cli()),
            VmSetting::Clipboard(v) => args.flag("--clipboard-mode", v.as_cli()),
            VmSetting::DragAndDrop(v) => args.flag("--drag-and-drop", v.as_cli()),
            VmSetting::Ioapic(on) => args.flag("--ioapic", on_off(*on)),
            VmSetting::Pae(on) => args.flag("--pae", on_off(*on)),
            VmSetting::NestedPaging(on) => args.flag("--nested-paging", on_off(*on)),
            VmSetting::Boot { slot: s, device } => {
                let n = slot(BOOT_SLOTS, *s, "Boot")?;
                args.flag(&format!("--boot{}", n), device.as_cli())
            }
            VmSetting::NicAttachment { slot: s, attachment } => {
                let n = slot(NIC_SLOTS, *s, "NIC")?;
                args.flag(&format!("--nic{}", n), attachment.as_cli())
            }
            VmSetting::NicType { slot: s, kind } => {
                let n = slot(NIC_SLOTS, *s, "NIC")?;
                args.flag(&format!("--nictype{}", n), kind.as_cli())
            }
            VmSetting::NicPromisc { slot: s, policy } => {
                let n = slot(NIC_SLOTS, *s, "NIC")?;
                args.flag(&format!("--nicpromisc{}", n), policy.as_cli())
            }
            VmSetting::NicCable { slot: s, connected } => {
                let n = slot(NIC_SLOTS, *s, "NIC")?;
                args.flag(&format!("--cableconnected{}", n), on_off(*connected))
            }
            VmSetting::BridgeAdapter { slot: s, adapter } => {
                let n = slot(NIC_SLOTS, *s, "NIC")?;
                args.flag(&format!("--bridgeadapter{}", n), adapter)
            }
            VmSetting::HostOnlyAdapter { slot: s, adapter } => {
                let n = slot(NIC_SLOTS, *s, "NIC")?;
                args.flag(&format!("--hostonlyadapter{}", n), adapter)
            }
            VmSetting::InternalNetwork { slot: s, network } => {
                let n = slot(NIC_SLOTS, *s, "NIC")?;
                args.flag(&format!("--intnet{}", n), network)
            }
            VmSetting::MacAddress { slot: s, mac } => {
                let n = slot(NIC_SLOTS, *s, "NIC")?;
                args.flag(&format!("--macaddress{}", n), mac)
            }
            VmSetting::Usb { controller, enabled } => args.flag(
                &format!("--usb{}", controller.as_cli()),
                on_off(*enabled),
            ),
            VmSetting::Audio(on) => args.flag("--audio-enabled", on_off(*on)),
        })
    }
}

/// `modifyvm <uuid>` carrying every change in `settings`.
pub fn modify_args(uuid: &str, settings: &[VmSetting]) -> VboxResult<Args> {
    settings
        .iter()
        .try_fold(Args::new("modifyvm").arg(uuid), |args, s| s.append_to(args))
}

// ─── VM Manager ──────────────────────────────────────────────────────

/// VM lifecycle and settings operations.
pub struct VmManager;

impl VmManager {
    // ── Lifecycle ────────────────────────────────────────────────────

    pub fn start(ctx: &VmContext, mode: StartMode) -> Operation {
        info!("Starting VM {} ({})", ctx.uuid(), mode);
        let args = Args::new("startvm").arg(ctx.uuid()).flag("--type", mode.as_cli());
        long_operation(ctx, "start", args, Check::Marker(&*STARTED_MARKER))
    }

    pub fn save_state(ctx: &VmContext) -> Operation {
        info!("Saving state of VM {}", ctx.uuid());
        let args = Args::new("controlvm").arg(ctx.uuid()).arg("savestate");
        long_operation(ctx, "save state", args, Check::Marker(&*COMPLETE_MARKER))
    }

    /// Press the ACPI power button. `command` resolves once the request is
    /// delivered; `settled` once the guest has powered off, or with a
    /// timeout error after [`ACPI_SHUTDOWN_LIMIT`].
    pub fn acpi_shutdown(ctx: &VmContext) -> Operation {
        Self::acpi_shutdown_within(ctx, ACPI_POLL_INTERVAL, ACPI_SHUTDOWN_LIMIT)
    }

    pub fn acpi_shutdown_within(ctx: &VmContext, poll: Duration, limit: Duration) -> Operation {
        info!("ACPI shutdown of VM {}", ctx.uuid());
        let args = Args::new("controlvm").arg(ctx.uuid()).arg("acpipowerbutton");
        long_operation_then(ctx, "acpi shutdown", args, Check::Exit, move |ctx| {
            wait_powered_off(ctx, poll, limit)
        })
    }

    pub fn power_off(ctx: &VmContext) -> Operation {
        info!("Powering off VM {}", ctx.uuid());
        let args = Args::new("controlvm").arg(ctx.uuid()).arg("poweroff");
        long_operation(ctx, "power off", args, Check::Marker(&*COMPLETE_MARKER))
    }

    pub async fn pause(ctx: &VmContext) -> VboxResult<Task<()>> {
        info!("Pausing VM {}", ctx.uuid());
        mutate(ctx, Args::new("controlvm").arg(ctx.uuid()).arg("pause"), Check::Exit).await
    }

    pub async fn resume(ctx: &VmContext) -> VboxResult<Task<()>> {
        info!("Resuming VM {}", ctx.uuid());
        mutate(ctx, Args::new("controlvm").arg(ctx.uuid()).arg("resume"), Check::Exit).await
    }

    pub async fn reset(ctx: &VmContext) -> VboxResult<Task<()>> {
        info!("Resetting VM {}", ctx.uuid());
        mutate(ctx, Args::new("controlvm").arg(ctx.uuid()).arg("reset"), Check::Exit).await
    }

    pub async fn discard_state(ctx: &VmContext) -> VboxResult<Task<()>> {
        info!("Discarding saved state of VM {}", ctx.uuid());
        mutate(ctx, Args::new("discardstate").arg(ctx.uuid()), Check::Exit).await
    }

    // ── Settings ─────────────────────────────────────────────────────

    /// Apply several settings in one `modifyvm`. Nothing is run for an
    /// empty list.
    pub async fn modify(ctx: &VmContext, settings: &[VmSetting]) -> VboxResult<Task<()>> {
        if settings.is_empty() {
            return Ok(Task::ready("modify (nothing to do)", Ok(())));
        }
        let args = modify_args(ctx.uuid(), settings)?;
        mutate(ctx, args, Check::Silent).await
    }

    pub async fn set_cpus(ctx: &VmContext, cpus: u32) -> VboxResult<Task<()>> {
        Self::modify(ctx, &[VmSetting::Cpus(cpus)]).await
    }

    pub async fn set_memory(ctx: &VmContext, megabytes: u32) -> VboxResult<Task<()>> {
        Self::modify(ctx, &[VmSetting::MemoryMb(megabytes)]).await
    }

    pub async fn rename(ctx: &VmContext, name: &str) -> VboxResult<Task<()>> {
        Self::modify(ctx, &[VmSetting::Name(name.to_string())]).await
    }

    pub async fn set_description(ctx: &VmContext, description: &str) -> VboxResult<Task<()>> {
        Self::modify(ctx, &[VmSetting::Description(description.to_string())]).await
    }

    // ── Appliances / Registration ────────────────────────────────────

    /// `export <uuid> --output <file>`.
    pub fn export(ctx: &VmContext, output_path: &str) -> Operation {
        info!("Exporting VM {} to {}", ctx.uuid(), output_path);
        let args = Args::new("export").arg(ctx.uuid()).flag("--output", output_path);
        long_operation(ctx, "export", args, Check::Marker(&*COMPLETE_MARKER))
    }

    /// `clonevm <uuid> --name=<name> [--register]`. Settles once the
    /// server's VM list has been re-read.
    pub fn clone_vm(server: &Arc<Server>, ctx: &VmContext, name: &str, register: bool) -> Task<()> {
        info!("Cloning VM {} as {}", ctx.uuid(), name);
        let args = Args::new("clonevm")
            .arg(ctx.uuid())
            .flag_eq("--name", name)
            .switch("--register", register);
        let server = Arc::clone(server);
        let ctx = ctx.clone();
        Task::spawn(format!("clone {}", name), move |reporter| async move {
            run_live_checked(&ctx, &args, reporter.track_output(), Check::Marker(&*COMPLETE_MARKER))
                .await?;
            server.refresh_machines().await?;
            Ok(())
        })
    }

    /// `unregistervm <uuid> [--delete]`; the VM leaves the server's list.
    pub fn unregister(server: &Arc<Server>, ctx: &VmContext, delete: bool) -> Task<()> {
        info!("Unregistering VM {} (delete files: {})", ctx.uuid(), delete);
        let args = Args::new("unregistervm").arg(ctx.uuid()).switch("--delete", delete);
        let server = Arc::clone(server);
        let ctx = ctx.clone();
        Task::spawn(format!("unregister {}", ctx.uuid()), move |reporter| async move {
            run_live_checked(&ctx, &args, reporter.track_output(), Check::Exit).await?;
            server.refresh_machines().await?;
            server.invalidate_media().await;
            Ok(())
        })
    }

    /// `import <ovf>`; new VMs appear in the server's list on success.
    pub fn import(server: &Arc<Server>, ovf_path: &str) -> Task<()> {
        info!("Importing {} on {}", ovf_path, server.name());
        let args = Args::new("import").arg(ovf_path);
        let server = Arc::clone(server);
        Task::spawn(format!("import {}", ovf_path), move |reporter| async move {
            server
                .invoke_live(args.as_slice(), reporter.track_output())
                .await?
                .check_marker(&COMPLETE_MARKER)?;
            server.refresh_machines().await?;
            server.invalidate_media().await;
            Ok(())
        })
    }
}
