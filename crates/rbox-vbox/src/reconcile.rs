//! Desired-versus-observed reconciliation of a VM's child collections.
//!
//! Planning is pure: [`plan_storage`], [`plan_usb_filters`] and
//! [`plan_shared_folders`] compare an edited copy against the last observed
//! collection and return the commands that turn one into the other, in
//! dependency order. [`apply`] issues them one by one. Nothing can be rolled
//! back on the remote side, so a failed command is reported and the rest
//! still run; the VM is refreshed afterwards and the report carries what
//! was actually observed.
//!
//! Item matching works the same for every collection. Every desired item
//! starts as `New` and every observed one as `Invalid`. Items with the same
//! identity are linked and both marked `Unchanged` or `Changed` depending on
//! their other fields. Observed items left over are `Removed`.

use crate::error::{VboxError, VboxErrorKind, VboxResult};
use crate::storage::{
    attach_args, controller_add_args, controller_modify_args, controller_remove_args,
    controller_rename_args, detach_args,
};
use crate::devices::{
    shared_folder_add_args, shared_folder_remove_args, usb_filter_add_args,
    usb_filter_modify_args, usb_filter_remove_args,
};
use crate::transport::Args;
use crate::types::{SharedFolder, StorageController, StorageMedium, UsbFilter};
use crate::vm::{run_checked, Check, VmContext};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ─── Classification ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ItemState {
    New,
    /// Observed but not (yet) matched by any desired item.
    Invalid,
    Unchanged,
    Changed,
    Removed,
}

/// Outcome of matching two collections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Matching {
    pub desired: Vec<ItemState>,
    pub observed: Vec<ItemState>,
    /// Desired index to the observed item it was matched with.
    pub links: Vec<Option<usize>>,
}

impl Matching {
    pub fn linked(&self, desired: usize) -> Option<usize> {
        self.links.get(desired).copied().flatten()
    }
}

/// Match `desired` against `observed` by `identity`, comparing the rest
/// with `same`. Each observed item is matched at most once.
pub fn classify<T, K, I, S>(desired: &[T], observed: &[T], identity: I, same: S) -> Matching
where
    K: PartialEq,
    I: Fn(&T) -> K,
    S: Fn(&T, &T) -> bool,
{
    let mut m = Matching {
        desired: vec![ItemState::New; desired.len()],
        observed: vec![ItemState::Invalid; observed.len()],
        links: vec![None; desired.len()],
    };

    for (d, want) in desired.iter().enumerate() {
        let key = identity(want);
        let found = observed
            .iter()
            .enumerate()
            .find(|&(o, have)| m.observed[o] == ItemState::Invalid && identity(have) == key);
        if let Some((o, have)) = found {
            let state = if same(want, have) {
                ItemState::Unchanged
            } else {
                ItemState::Changed
            };
            m.desired[d] = state;
            m.observed[o] = state;
            m.links[d] = Some(o);
        }
    }

    for state in m.observed.iter_mut() {
        if *state == ItemState::Invalid {
            *state = ItemState::Removed;
        }
    }
    m
}

// ─── Plan ────────────────────────────────────────────────────────────

/// Global execution order. Commands run step by step; within a step they
/// keep the order they were planned in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ApplyStep {
    DetachFromRemovedController,
    RemoveController,
    UpdateController,
    AddController,
    AttachToNewController,
    DetachRemovedMedium,
    DetachChangedMedium,
    AttachChangedMedium,
    AttachNewMedium,
    ModifyUsbFilter,
    RemoveUsbFilter,
    AddUsbFilter,
    RemoveSharedFolder,
    AddSharedFolder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedCommand {
    pub step: ApplyStep,
    pub summary: String,
    pub args: Args,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Plan {
    pub commands: Vec<PlannedCommand>,
}

impl Plan {
    fn push(&mut self, step: ApplyStep, summary: String, args: Args) {
        self.commands.push(PlannedCommand { step, summary, args });
    }

    fn finish(mut self) -> Self {
        self.commands.sort_by_key(|c| c.step);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn steps(&self) -> Vec<ApplyStep> {
        self.commands.iter().map(|c| c.step).collect()
    }
}

// ─── Storage ─────────────────────────────────────────────────────────

fn controller_identity(ctl: &StorageController) -> (Option<crate::types::StorageChipset>, String) {
    (ctl.chipset, ctl.observed_name().to_string())
}

/// Media are reconciled separately, so only the controller's own fields
/// count here. A desired controller without a port count accepts any.
fn controller_same(want: &StorageController, have: &StorageController) -> bool {
    want.name == have.name
        && want.bootable == have.bootable
        && (want.port_count.is_none() || want.port_count == have.port_count)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum MediumKey {
    Image(String),
    Slot(u32, u32),
}

fn medium_identity(medium: &StorageMedium) -> MediumKey {
    match &medium.image_uuid {
        Some(uuid) => MediumKey::Image(uuid.clone()),
        None => MediumKey::Slot(medium.port, medium.device),
    }
}

/// Renames happen before new controllers are added and after removed ones
/// are gone, so a name may only clash with a surviving controller's
/// current name or with another desired controller.
fn check_controller_names(
    desired: &[StorageController],
    observed: &[StorageController],
    m: &Matching,
) -> VboxResult<()> {
    let mut seen = HashSet::new();
    for ctl in desired {
        if !seen.insert(ctl.name.as_str()) {
            return Err(VboxError::conflict(format!(
                "More than one storage controller is named '{}'",
                ctl.name
            )));
        }
    }

    for (d, want) in desired.iter().enumerate() {
        let Some(o) = m.linked(d) else { continue };
        if want.name == observed[o].name {
            continue;
        }
        let clash = observed.iter().enumerate().any(|(i, other)| {
            i != o && m.observed[i] != ItemState::Removed && other.name == want.name
        });
        if clash {
            return Err(VboxError::conflict(format!(
                "Cannot rename controller '{}' to '{}': another controller already has that name",
                observed[o].name, want.name
            )));
        }
    }
    Ok(())
}

/// Commands turning the `observed` storage graph of VM `uuid` into
/// `desired`. Name collisions are rejected before anything is planned.
pub fn plan_storage(
    uuid: &str,
    desired: &[StorageController],
    observed: &[StorageController],
) -> VboxResult<Plan> {
    let controllers = classify(desired, observed, controller_identity, controller_same);
    check_controller_names(desired, observed, &controllers)?;

    let mut plan = Plan::default();

    for (o, have) in observed.iter().enumerate() {
        if controllers.observed[o] != ItemState::Removed {
            continue;
        }
        for medium in &have.media {
            plan.push(
                ApplyStep::DetachFromRemovedController,
                format!("detach {}:{}:{}", have.name, medium.port, medium.device),
                detach_args(uuid, &have.name, medium.port, medium.device),
            );
        }
        plan.push(
            ApplyStep::RemoveController,
            format!("remove controller {}", have.name),
            controller_remove_args(uuid, &have.name),
        );
    }

    for (d, want) in desired.iter().enumerate() {
        let state = controllers.desired[d];
        let Some(o) = controllers.linked(d) else {
            plan.push(
                ApplyStep::AddController,
                format!("add controller {}", want.name),
                controller_add_args(uuid, want)?,
            );
            for medium in &want.media {
                plan.push(
                    ApplyStep::AttachToNewController,
                    format!("attach {} to {}:{}:{}", medium.medium_argument(), want.name, medium.port, medium.device),
                    attach_args(uuid, &want.name, medium),
                );
            }
            continue;
        };

        let have = &observed[o];
        if state == ItemState::Changed {
            if want.name != have.name {
                plan.push(
                    ApplyStep::UpdateController,
                    format!("rename controller {} to {}", have.name, want.name),
                    controller_rename_args(uuid, &have.name, &want.name),
                );
            }
            if want.bootable != have.bootable
                || (want.port_count.is_some() && want.port_count != have.port_count)
            {
                plan.push(
                    ApplyStep::UpdateController,
                    format!("update controller {}", want.name),
                    controller_modify_args(uuid, want),
                );
            }
        }
        plan_media(&mut plan, uuid, want, have);
    }

    Ok(plan.finish())
}

/// Media of a controller that exists on both sides. Commands address the
/// controller by its desired name since renames run first.
fn plan_media(plan: &mut Plan, uuid: &str, want: &StorageController, have: &StorageController) {
    let media = classify(&want.media, &have.media, medium_identity, |a, b| a == b);

    for (o, gone) in have.media.iter().enumerate() {
        if media.observed[o] == ItemState::Removed {
            plan.push(
                ApplyStep::DetachRemovedMedium,
                format!("detach {}:{}:{}", want.name, gone.port, gone.device),
                detach_args(uuid, &want.name, gone.port, gone.device),
            );
        }
    }

    for (d, medium) in want.media.iter().enumerate() {
        match (media.desired[d], media.linked(d)) {
            (ItemState::Changed, Some(o)) => {
                let old = &have.media[o];
                plan.push(
                    ApplyStep::DetachChangedMedium,
                    format!("detach {}:{}:{}", want.name, old.port, old.device),
                    detach_args(uuid, &want.name, old.port, old.device),
                );
                plan.push(
                    ApplyStep::AttachChangedMedium,
                    format!("reattach {} at {}:{}:{}", medium.medium_argument(), want.name, medium.port, medium.device),
                    attach_args(uuid, &want.name, medium),
                );
            }
            (ItemState::New, _) => plan.push(
                ApplyStep::AttachNewMedium,
                format!("attach {} to {}:{}:{}", medium.medium_argument(), want.name, medium.port, medium.device),
                attach_args(uuid, &want.name, medium),
            ),
            _ => {}
        }
    }
}

// ─── USB Filters / Shared Folders ────────────────────────────────────

/// Filters are addressed by position. Modifications run first, then
/// removals from the highest index down so lower positions stay valid,
/// then additions at the end of the list.
pub fn plan_usb_filters(uuid: &str, desired: &[UsbFilter], observed: &[UsbFilter]) -> Plan {
    let m = classify(desired, observed, |f: &UsbFilter| f.index, |a, b| a == b);
    let mut plan = Plan::default();

    for (d, want) in desired.iter().enumerate() {
        if m.desired[d] == ItemState::Changed {
            if let Some(index) = m.linked(d).and_then(|o| observed[o].index) {
                plan.push(
                    ApplyStep::ModifyUsbFilter,
                    format!("modify USB filter {} ({})", index, want.name),
                    usb_filter_modify_args(uuid, index, want),
                );
            }
        }
    }

    let mut removed: Vec<u32> = observed
        .iter()
        .enumerate()
        .filter(|&(o, _)| m.observed[o] == ItemState::Removed)
        .filter_map(|(_, f)| f.index)
        .collect();
    removed.sort_unstable_by(|a, b| b.cmp(a));
    for index in &removed {
        plan.push(
            ApplyStep::RemoveUsbFilter,
            format!("remove USB filter {}", index),
            usb_filter_remove_args(uuid, *index),
        );
    }

    let mut next = (observed.len() - removed.len()) as u32;
    for (d, want) in desired.iter().enumerate() {
        if m.desired[d] == ItemState::New {
            plan.push(
                ApplyStep::AddUsbFilter,
                format!("add USB filter {} ({})", next, want.name),
                usb_filter_add_args(uuid, next, want),
            );
            next += 1;
        }
    }

    plan.finish()
}

/// Folders are identified by name; any other change is remove then add.
pub fn plan_shared_folders(uuid: &str, desired: &[SharedFolder], observed: &[SharedFolder]) -> Plan {
    let m = classify(desired, observed, |f: &SharedFolder| f.name.clone(), |a, b| a == b);
    let mut plan = Plan::default();

    for (o, have) in observed.iter().enumerate() {
        if matches!(m.observed[o], ItemState::Removed | ItemState::Changed) {
            plan.push(
                ApplyStep::RemoveSharedFolder,
                format!("remove shared folder {}", have.name),
                shared_folder_remove_args(uuid, &have.name),
            );
        }
    }
    for (d, want) in desired.iter().enumerate() {
        if matches!(m.desired[d], ItemState::New | ItemState::Changed) {
            plan.push(
                ApplyStep::AddSharedFolder,
                format!("add shared folder {}", want.name),
                shared_folder_add_args(uuid, want),
            );
        }
    }

    plan.finish()
}

// ─── Apply ───────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum ItemOutcome {
    Applied,
    Failed(VboxError),
    /// Not attempted because the transport went away.
    Skipped,
}

#[derive(Debug, Clone)]
pub struct ItemReport {
    pub step: ApplyStep,
    pub summary: String,
    pub outcome: ItemOutcome,
}

#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub items: Vec<ItemReport>,
    /// Set when the closing refresh failed; `controllers` is stale then.
    pub refresh_error: Option<VboxError>,
    /// Storage graph as observed after applying.
    pub controllers: Vec<StorageController>,
}

impl ApplyReport {
    pub fn is_clean(&self) -> bool {
        self.refresh_error.is_none()
            && self
                .items
                .iter()
                .all(|i| matches!(i.outcome, ItemOutcome::Applied))
    }

    pub fn failures(&self) -> impl Iterator<Item = (&ItemReport, &VboxError)> {
        self.items.iter().filter_map(|i| match &i.outcome {
            ItemOutcome::Failed(e) => Some((i, e)),
            _ => None,
        })
    }
}

/// Issue every planned command, then refresh the VM and wait for it.
pub async fn apply(ctx: &VmContext, plan: &Plan) -> ApplyReport {
    let mut items = Vec::with_capacity(plan.len());
    let mut halted = false;

    for cmd in &plan.commands {
        let outcome = if halted {
            ItemOutcome::Skipped
        } else {
            match run_checked(ctx, &cmd.args, Check::Silent).await {
                Ok(_) => {
                    debug!("Applied '{}' on VM {}", cmd.summary, ctx.uuid());
                    ItemOutcome::Applied
                }
                Err(e) => {
                    warn!("'{}' failed on VM {}: {}", cmd.summary, ctx.uuid(), e);
                    if matches!(e.kind, VboxErrorKind::TransportStart | VboxErrorKind::NotConnected) {
                        halted = true;
                    }
                    ItemOutcome::Failed(e)
                }
            }
        };
        items.push(ItemReport {
            step: cmd.step,
            summary: cmd.summary.clone(),
            outcome,
        });
    }

    let refresh_error = if plan.is_empty() {
        None
    } else {
        ctx.refresh().await.err()
    };
    ApplyReport {
        items,
        refresh_error,
        controllers: ctx.machine.storage_controllers().await,
    }
}

async fn ensure_observed(ctx: &VmContext) -> VboxResult<()> {
    if !ctx.machine.state().is_populated().await {
        ctx.refresh().await?;
    }
    Ok(())
}

/// Bring the VM's storage graph to `desired`.
pub async fn reconcile_storage(ctx: &VmContext, desired: &[StorageController]) -> VboxResult<ApplyReport> {
    ensure_observed(ctx).await?;
    let observed = ctx.machine.storage_controllers().await;
    let plan = plan_storage(ctx.uuid(), desired, &observed)?;
    info!("Reconciling storage of VM {}: {} command(s)", ctx.uuid(), plan.len());
    Ok(apply(ctx, &plan).await)
}

pub async fn reconcile_usb_filters(ctx: &VmContext, desired: &[UsbFilter]) -> VboxResult<ApplyReport> {
    ensure_observed(ctx).await?;
    let observed = ctx.machine.usb_filters().await;
    let plan = plan_usb_filters(ctx.uuid(), desired, &observed);
    info!("Reconciling USB filters of VM {}: {} command(s)", ctx.uuid(), plan.len());
    Ok(apply(ctx, &plan).await)
}

pub async fn reconcile_shared_folders(ctx: &VmContext, desired: &[SharedFolder]) -> VboxResult<ApplyReport> {
    ensure_observed(ctx).await?;
    let observed = ctx.machine.shared_folders().await;
    let plan = plan_shared_folders(ctx.uuid(), desired, &observed);
    info!("Reconciling shared folders of VM {}: {} command(s)", ctx.uuid(), plan.len());
    Ok(apply(ctx, &plan).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::Machine;
    use crate::testing::ScriptedRunner;
    use crate::transport::Transport;
    use crate::types::{MediumKind, StorageChipset};
    use std::sync::Arc;

    fn disk(port: u32, path: &str, uuid: &str) -> StorageMedium {
        let mut m = StorageMedium::new(port, 0, MediumKind::Hdd, Some(path.to_string()));
        m.image_uuid = Some(uuid.to_string());
        m
    }

    fn observed_sata() -> StorageController {
        let mut ctl = StorageController::new("SATA", StorageChipset::IntelAhci)
            .with_medium(disk(0, "/vms/a.vdi", "aaaa"))
            .with_medium(disk(1, "/vms/b.vdi", "bbbb"));
        ctl.original_name = Some("SATA".into());
        ctl.port_count = Some(2);
        ctl
    }

    fn lines(plan: &Plan) -> Vec<String> {
        plan.commands
            .iter()
            .map(|c| c.args.as_slice().join(" "))
            .collect()
    }

    #[test]
    fn classify_marks_new_removed_changed() {
        let desired = vec![("a", 1), ("b", 2), ("c", 3)];
        let observed = vec![("a", 1), ("b", 9), ("d", 4)];
        let m = classify(&desired, &observed, |x| x.0, |x, y| x.1 == y.1);
        assert_eq!(
            m.desired,
            vec![ItemState::Unchanged, ItemState::Changed, ItemState::New]
        );
        assert_eq!(
            m.observed,
            vec![ItemState::Unchanged, ItemState::Changed, ItemState::Removed]
        );
        assert_eq!(m.links, vec![Some(0), Some(1), None]);
    }

    #[test]
    fn self_reconcile_is_a_no_op() {
        let observed = vec![observed_sata()];
        let plan = plan_storage("u1", &observed, &observed).unwrap();
        assert!(plan.is_empty());

        let m = classify(&observed, &observed, controller_identity, controller_same);
        assert!(m.desired.iter().all(|s| *s == ItemState::Unchanged));
    }

    #[test]
    fn new_controller_is_added_before_its_media() {
        let desired = vec![StorageController::new("ControllerA", StorageChipset::IntelAhci)
            .with_medium(disk(0, "/vms/a.vdi", "aaaa"))
            .with_medium(disk(1, "/vms/b.vdi", "bbbb"))];
        let plan = plan_storage("u1", &desired, &[]).unwrap();
        assert_eq!(
            plan.steps(),
            vec![
                ApplyStep::AddController,
                ApplyStep::AttachToNewController,
                ApplyStep::AttachToNewController
            ]
        );
        let cmds = lines(&plan);
        assert!(cmds[0].starts_with("storagectl u1 --name ControllerA --add sata"));
        assert!(cmds[1].contains("--port 0"));
        assert!(cmds[2].contains("--port 1"));
    }

    #[test]
    fn removed_controller_detaches_media_first() {
        let plan = plan_storage("u1", &[], &[observed_sata()]).unwrap();
        assert_eq!(
            plan.steps(),
            vec![
                ApplyStep::DetachFromRemovedController,
                ApplyStep::DetachFromRemovedController,
                ApplyStep::RemoveController
            ]
        );
        assert_eq!(lines(&plan)[2], "storagectl u1 --name SATA --remove");
    }

    #[test]
    fn rename_runs_before_media_changes() {
        let observed = vec![observed_sata()];
        let mut edited = observed_sata();
        edited.name = "Disks".into();
        edited.media[1].nonrotational = true;
        edited.media.push(StorageMedium::new(2, 0, MediumKind::Dvd, None));

        let plan = plan_storage("u1", &[edited], &observed).unwrap();
        assert_eq!(
            plan.steps(),
            vec![
                ApplyStep::UpdateController,
                ApplyStep::DetachChangedMedium,
                ApplyStep::AttachChangedMedium,
                ApplyStep::AttachNewMedium
            ]
        );
        let cmds = lines(&plan);
        assert_eq!(cmds[0], "storagectl u1 --name SATA --rename Disks");
        assert!(cmds[1].starts_with("storageattach u1 --storagectl Disks --port 1 --device 0 --medium none"));
        assert!(cmds[2].contains("--nonrotational on"));
        assert!(cmds[3].contains("--medium emptydrive"));
    }

    #[test]
    fn changing_chipset_replaces_the_controller() {
        let observed = vec![observed_sata()];
        let mut edited = observed_sata();
        edited.chipset = Some(StorageChipset::NVMe);
        edited.original_name = None;
        let plan = plan_storage("u1", &[edited], &observed).unwrap();
        assert_eq!(
            plan.steps().iter().filter(|s| **s == ApplyStep::RemoveController).count(),
            1
        );
        assert_eq!(
            plan.steps().iter().filter(|s| **s == ApplyStep::AddController).count(),
            1
        );
    }

    #[test]
    fn controller_of_unknown_type_can_be_kept_or_removed() {
        let mut fibre = StorageController::unrecognised("Fibre", "FibreChannel")
            .with_medium(disk(0, "/vms/c.vdi", "cccc"));
        fibre.original_name = Some("Fibre".into());
        let observed = vec![observed_sata(), fibre.clone()];

        assert!(plan_storage("u1", &observed, &observed).unwrap().is_empty());

        let mut edited = fibre.clone();
        edited.bootable = false;
        let plan = plan_storage("u1", &[observed_sata(), edited], &observed).unwrap();
        assert_eq!(lines(&plan), vec!["storagectl u1 --name Fibre --bootable off"]);

        let plan = plan_storage("u1", &[observed_sata()], &observed).unwrap();
        assert_eq!(
            plan.steps(),
            vec![ApplyStep::DetachFromRemovedController, ApplyStep::RemoveController]
        );
        assert_eq!(lines(&plan)[1], "storagectl u1 --name Fibre --remove");

        let mut fresh = fibre;
        fresh.name = "Other".into();
        fresh.original_name = None;
        let err = plan_storage("u1", &[observed_sata(), fresh], &[observed_sata()]).unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::UnmappedValue);
    }

    #[test]
    fn rename_onto_surviving_controller_is_a_conflict() {
        let mut ide = StorageController::new("IDE", StorageChipset::Piix4);
        ide.original_name = Some("IDE".into());
        let observed = vec![observed_sata(), ide.clone()];

        let mut renamed = observed_sata();
        renamed.name = "IDE".into();
        let mut moved_ide = ide;
        moved_ide.name = "Optical".into();

        let err = plan_storage("u1", &[renamed.clone(), moved_ide], &observed).unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::Conflict);

        let err = plan_storage("u1", &[renamed, observed[1].clone()], &observed).unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::Conflict);
    }

    #[test]
    fn rename_onto_removed_controller_is_allowed() {
        let mut ide = StorageController::new("IDE", StorageChipset::Piix4);
        ide.original_name = Some("IDE".into());
        let observed = vec![observed_sata(), ide];
        let mut renamed = observed_sata();
        renamed.name = "IDE".into();

        let plan = plan_storage("u1", &[renamed], &observed).unwrap();
        assert_eq!(
            plan.steps(),
            vec![ApplyStep::RemoveController, ApplyStep::UpdateController]
        );
    }

    #[test]
    fn usb_filters_keep_indices_valid() {
        let filter = |index: Option<u32>, name: &str| UsbFilter {
            index,
            name: name.into(),
            active: true,
            ..UsbFilter::default()
        };
        let observed = vec![filter(Some(0), "a"), filter(Some(1), "b"), filter(Some(2), "c")];
        let mut changed_c = observed[2].clone();
        changed_c.active = false;
        let desired = vec![changed_c, filter(None, "d")];

        let plan = plan_usb_filters("u1", &desired, &observed);
        assert_eq!(
            lines(&plan),
            vec![
                "usbfilter modify 2 --target u1 --name c --active no",
                "usbfilter remove 1 --target u1",
                "usbfilter remove 0 --target u1",
                "usbfilter add 1 --target u1 --name d --active yes",
            ]
        );
    }

    #[test]
    fn changed_shared_folder_is_readded() {
        let folder = SharedFolder {
            name: "share".into(),
            host_path: "/srv/share".into(),
            read_only: false,
            auto_mount: false,
        };
        let mut moved = folder.clone();
        moved.host_path = "/srv/other".into();
        let plan = plan_shared_folders("u1", &[moved], &[folder]);
        assert_eq!(
            plan.steps(),
            vec![ApplyStep::RemoveSharedFolder, ApplyStep::AddSharedFolder]
        );
    }

    #[tokio::test]
    async fn apply_continues_past_failures_and_refreshes() {
        let runner = ScriptedRunner::new();
        runner.respond_stderr(
            "storageattach u1 --storagectl ControllerA --port 0",
            1,
            "VBoxManage: error: Could not find file for the medium '/vms/a.vdi'\n",
        );
        runner.respond(
            "showvminfo u1 --machinereadable",
            0,
            "storagecontrollername0=\"ControllerA\"\nstoragecontrollertype0=\"IntelAhci\"\n\"ControllerA-1-0\"=\"/vms/b.vdi\"\n",
        );
        let transport = Arc::new(Transport::new(runner.clone(), "VBoxManage"));
        let ctx = VmContext::new(transport, Arc::new(Machine::new("u1", "web", 16)));

        let desired = vec![StorageController::new("ControllerA", StorageChipset::IntelAhci)
            .with_medium(disk(0, "/vms/a.vdi", "aaaa"))
            .with_medium(disk(1, "/vms/b.vdi", "bbbb"))];
        let plan = plan_storage("u1", &desired, &[]).unwrap();
        let report = apply(&ctx, &plan).await;

        assert_eq!(report.items.len(), 3);
        assert!(!report.is_clean());
        assert_eq!(report.failures().count(), 1);
        assert!(matches!(report.items[2].outcome, ItemOutcome::Applied));
        assert_eq!(runner.count("showvminfo"), 1);
        assert_eq!(report.controllers.len(), 1);
        assert_eq!(report.controllers[0].media.len(), 1);
    }

    #[tokio::test]
    async fn reconcile_reads_observed_from_cache() {
        let runner = ScriptedRunner::new();
        runner.respond(
            "showvminfo u1 --machinereadable",
            0,
            "storagecontrollername0=\"SATA\"\nstoragecontrollertype0=\"IntelAhci\"\nstoragecontrollerbootable0=\"on\"\n",
        );
        let transport = Arc::new(Transport::new(runner.clone(), "VBoxManage"));
        let ctx = VmContext::new(transport, Arc::new(Machine::new("u1", "web", 16)));

        ctx.refresh().await.unwrap();
        let current = ctx.machine.storage_controllers().await;
        let report = reconcile_storage(&ctx, &current).await.unwrap();
        assert!(report.items.is_empty());
        assert!(report.is_clean());
        assert_eq!(runner.issued().len(), 1);
    }
}
