//! Typed views over a VM property map.
//!
//! Values read back from the remote side that do not map onto a known
//! enum variant become `None` here; only values we send are checked
//! strictly.

use crate::types::{
    Chipset, FirmwareType, GraphicsController, MediumKind, NicSummary, PropertyMap, RunState,
    SharedFolder, StorageBus, StorageChipset, StorageController, StorageMedium, UsbFilter,
};
use lazy_static::lazy_static;
use log::warn;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref ATTACHMENT_KEY: Regex =
        Regex::new(r"^(.+)-(\d+)-(\d+)$").expect("valid attachment key regex");
}

fn get<'a>(map: &'a PropertyMap, key: &str) -> Option<&'a str> {
    map.get(key).map(String::as_str)
}

fn is_on(map: &PropertyMap, key: &str) -> bool {
    matches!(get(map, key), Some("on" | "yes" | "true"))
}

fn number(map: &PropertyMap, key: &str) -> Option<u32> {
    get(map, key).and_then(|v| v.trim().parse().ok())
}

// ─── Summary ─────────────────────────────────────────────────────────

/// Headline settings of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmSummary {
    pub uuid: String,
    pub name: String,
    pub state: RunState,
    pub os_type: String,
    pub description: String,
    pub cpus: Option<u32>,
    pub memory_mb: Option<u32>,
    pub vram_mb: Option<u32>,
    pub firmware: Option<FirmwareType>,
    pub chipset: Option<Chipset>,
    pub graphics: Option<GraphicsController>,
    pub current_snapshot: Option<String>,
}

pub fn summary(map: &PropertyMap) -> VmSummary {
    VmSummary {
        uuid: get(map, "UUID").unwrap_or_default().to_string(),
        name: get(map, "name").unwrap_or_default().to_string(),
        state: get(map, "VMState")
            .map(RunState::from_vm_state)
            .unwrap_or_default(),
        os_type: get(map, "ostype").unwrap_or_default().to_string(),
        description: get(map, "description").unwrap_or_default().to_string(),
        cpus: number(map, "cpus"),
        memory_mb: number(map, "memory"),
        vram_mb: number(map, "vram"),
        firmware: get(map, "firmware").and_then(|v| FirmwareType::from_cli(v).ok()),
        chipset: get(map, "chipset").and_then(|v| Chipset::from_cli(v).ok()),
        graphics: get(map, "graphicscontroller").and_then(|v| GraphicsController::from_cli(v).ok()),
        current_snapshot: get(map, "CurrentSnapshotName").map(str::to_string),
    }
}

// ─── Storage ─────────────────────────────────────────────────────────

fn guess_kind(bus: Option<StorageBus>, location: Option<&str>) -> MediumKind {
    if bus == Some(StorageBus::Floppy) {
        return MediumKind::Floppy;
    }
    match location {
        None => MediumKind::Dvd,
        Some(path) if path.to_ascii_lowercase().ends_with(".iso") => MediumKind::Dvd,
        Some(_) => MediumKind::Hdd,
    }
}

/// Controllers and their attachments, in controller index order.
///
/// Every controller comes back with `original_name` set to its current
/// name so an edited copy can be reconciled against this one. A controller
/// of an unknown type is still listed, with `chipset` unset.
pub fn storage_controllers(map: &PropertyMap) -> Vec<StorageController> {
    let mut controllers = Vec::new();
    for i in 0.. {
        let Some(name) = get(map, &format!("storagecontrollername{}", i)) else {
            break;
        };
        let reported = get(map, &format!("storagecontrollertype{}", i)).unwrap_or_default();

        let mut controller = match StorageChipset::from_cli(reported) {
            Ok(chipset) => StorageController::new(name, chipset),
            Err(_) => {
                warn!("Storage controller '{}' has unrecognised type '{}'", name, reported);
                StorageController::unrecognised(name, reported)
            }
        };
        controller.original_name = Some(name.to_string());
        controller.bootable = is_on(map, &format!("storagecontrollerbootable{}", i));
        controller.port_count = number(map, &format!("storagecontrollerportcount{}", i));
        controller.media = attachments(map, name, controller.bus());
        controllers.push(controller);
    }
    controllers
}

fn attachments(map: &PropertyMap, controller: &str, bus: Option<StorageBus>) -> Vec<StorageMedium> {
    let mut media: Vec<StorageMedium> = map
        .iter()
        .filter_map(|(key, value)| {
            let caps = ATTACHMENT_KEY.captures(key)?;
            if &caps[1] != controller || value == "none" {
                return None;
            }
            let port: u32 = caps[2].parse().ok()?;
            let device: u32 = caps[3].parse().ok()?;
            let location = match value.as_str() {
                "emptydrive" | "" => None,
                path => Some(path.to_string()),
            };
            let flag = |what: &str| is_on(map, &format!("{}-{}-{}-{}", controller, what, port, device));

            let mut medium = StorageMedium::new(port, device, guess_kind(bus, location.as_deref()), location);
            medium.image_uuid =
                get(map, &format!("{}-ImageUUID-{}-{}", controller, port, device)).map(str::to_string);
            medium.nonrotational = flag("nonrotational");
            medium.hot_pluggable = flag("hot-pluggable");
            medium.discard = flag("discard");
            medium.temp_eject = flag("tempeject");
            Some(medium)
        })
        .collect();
    media.sort_by_key(|m| (m.port, m.device));
    media
}

// ─── USB Filters / Shared Folders ────────────────────────────────────

/// USB filters, ordered by their remote index.
pub fn usb_filters(map: &PropertyMap) -> Vec<UsbFilter> {
    let mut filters = Vec::new();
    for i in 1.. {
        let Some(name) = get(map, &format!("USBFilterName{}", i)) else {
            break;
        };
        let text = |what: &str| get(map, &format!("USBFilter{}{}", what, i)).unwrap_or_default().to_string();
        filters.push(UsbFilter {
            index: Some(i - 1),
            name: name.to_string(),
            active: is_on(map, &format!("USBFilterActive{}", i)),
            vendor_id: text("VendorId"),
            product_id: text("ProductId"),
            revision: text("Revision"),
            manufacturer: text("Manufacturer"),
            product: text("Product"),
            serial_number: text("SerialNumber"),
            remote: text("Remote"),
        });
    }
    filters
}

/// Permanent (machine) shared folders.
pub fn shared_folders(map: &PropertyMap) -> Vec<SharedFolder> {
    let mut folders = Vec::new();
    for i in 1.. {
        let Some(name) = get(map, &format!("SharedFolderNameMachineMapping{}", i)) else {
            break;
        };
        folders.push(SharedFolder {
            name: name.to_string(),
            host_path: get(map, &format!("SharedFolderPathMachineMapping{}", i))
                .unwrap_or_default()
                .to_string(),
            read_only: false,
            auto_mount: false,
        });
    }
    folders
}

// ─── NICs ────────────────────────────────────────────────────────────

/// Adapter summaries from the extended refresh (`ext.nicN.*` keys).
pub fn nic_summaries(map: &PropertyMap) -> Vec<NicSummary> {
    (1..=8u32)
        .filter_map(|slot| {
            let prefix = format!("ext.nic{}", slot);
            let enabled = get(map, &format!("{}.enabled", prefix))?;
            let text = |what: &str| {
                get(map, &format!("{}.{}", prefix, what))
                    .unwrap_or_default()
                    .to_string()
            };
            Some(NicSummary {
                slot,
                enabled: enabled == "true",
                mac: text("mac"),
                attachment: text("attachment"),
                attachment_name: text("attachmentName"),
                cable_connected: text("cable") == "on",
                adapter_type: text("type"),
                promisc_policy: text("promisc"),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse::parse_machine_readable;

    fn sample() -> PropertyMap {
        parse_machine_readable(&[
            r#"name="web""#,
            r#"UUID="1111""#,
            r#"ostype="Ubuntu (64-bit)""#,
            r#"VMState="poweroff""#,
            r#"cpus=2"#,
            r#"memory=2048"#,
            r#"firmware="EFI""#,
            r#"graphicscontroller="vmsvga""#,
            r#"storagecontrollername0="IDE""#,
            r#"storagecontrollertype0="PIIX4""#,
            r#"storagecontrollerbootable0="on""#,
            r#"storagecontrollerportcount0="2""#,
            r#"storagecontrollername1="SATA""#,
            r#"storagecontrollertype1="IntelAhci""#,
            r#"storagecontrollerbootable1="on""#,
            r#""IDE-0-0"="none""#,
            r#""IDE-1-0"="emptydrive""#,
            r#""IDE-tempeject-1-0"="on""#,
            r#""SATA-0-0"="/vms/web/web.vdi""#,
            r#""SATA-ImageUUID-0-0"="aaaa-0001""#,
            r#""SATA-nonrotational-0-0"="on""#,
            r#""SATA-1-0"="/iso/ubuntu.iso""#,
            r#"USBFilterName1="logitech""#,
            r#"USBFilterActive1="on""#,
            r#"USBFilterVendorId1="046d""#,
            r#"SharedFolderNameMachineMapping1="share""#,
            r#"SharedFolderPathMachineMapping1="/srv/share""#,
        ])
    }

    #[test]
    fn summary_fields() {
        let s = summary(&sample());
        assert_eq!(s.name, "web");
        assert_eq!(s.state, RunState::Off);
        assert_eq!(s.cpus, Some(2));
        assert_eq!(s.firmware, Some(FirmwareType::Efi));
        assert_eq!(s.graphics, Some(GraphicsController::VmSvga));
        assert_eq!(s.vram_mb, None);
    }

    #[test]
    fn controllers_and_media() {
        let ctls = storage_controllers(&sample());
        assert_eq!(ctls.len(), 2);
        assert_eq!(ctls[0].chipset, Some(StorageChipset::Piix4));
        assert_eq!(ctls[0].original_name.as_deref(), Some("IDE"));
        assert_eq!(ctls[0].port_count, Some(2));
        assert_eq!(ctls[0].media.len(), 1);
        assert_eq!(ctls[0].media[0].kind, MediumKind::Dvd);
        assert!(ctls[0].media[0].temp_eject);
        assert_eq!(ctls[0].media[0].location, None);

        let sata = &ctls[1];
        assert_eq!(sata.media.len(), 2);
        assert_eq!(sata.media[0].kind, MediumKind::Hdd);
        assert_eq!(sata.media[0].image_uuid.as_deref(), Some("aaaa-0001"));
        assert!(sata.media[0].nonrotational);
        assert_eq!(sata.media[1].kind, MediumKind::Dvd);
    }

    #[test]
    fn controller_of_unknown_type_is_kept() {
        let map = parse_machine_readable(&[
            r#"storagecontrollername0="Fibre""#,
            r#"storagecontrollertype0="FibreChannel""#,
            r#"storagecontrollerbootable0="off""#,
            r#"storagecontrollername1="SATA""#,
            r#"storagecontrollertype1="IntelAhci""#,
            r#""Fibre-0-0"="/vms/web/data.vdi""#,
            r#""Fibre-ImageUUID-0-0"="bbbb-0002""#,
        ]);
        let ctls = storage_controllers(&map);
        assert_eq!(ctls.len(), 2);

        let fibre = &ctls[0];
        assert_eq!(fibre.name, "Fibre");
        assert_eq!(fibre.chipset, None);
        assert_eq!(fibre.type_label(), "FibreChannel");
        assert_eq!(fibre.original_name.as_deref(), Some("Fibre"));
        assert_eq!(fibre.media.len(), 1);
        assert_eq!(fibre.media[0].kind, MediumKind::Hdd);
        assert_eq!(fibre.media[0].image_uuid.as_deref(), Some("bbbb-0002"));
        assert_eq!(ctls[1].chipset, Some(StorageChipset::IntelAhci));
    }

    #[test]
    fn filters_and_folders() {
        let map = sample();
        let filters = usb_filters(&map);
        assert_eq!(filters.len(), 1);
        assert_eq!(filters[0].index, Some(0));
        assert!(filters[0].active);
        assert_eq!(filters[0].vendor_id, "046d");

        let folders = shared_folders(&map);
        assert_eq!(folders[0].host_path, "/srv/share");
    }

    #[test]
    fn nic_summaries_from_extended_keys() {
        let mut map = PropertyMap::new();
        map.insert("ext.nic1.enabled".into(), "true".into());
        map.insert("ext.nic1.attachmentName".into(), "eth0".into());
        map.insert("ext.nic1.cable".into(), "on".into());
        map.insert("ext.nic3.enabled".into(), "false".into());
        let nics = nic_summaries(&map);
        assert_eq!(nics.len(), 2);
        assert!(nics[0].cable_connected);
        assert_eq!(nics[0].attachment_name, "eth0");
        assert_eq!(nics[1].slot, 3);
        assert!(!nics[1].enabled);
    }
}
