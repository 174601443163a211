//! Shared types for the VirtualBox management crate.
//!
//! Covers configuration, the run-state enum, the strict CLI vocabularies
//! (one mapping table per enumerated setting), records parsed from the
//! various `VBoxManage list` dialects, the storage graph and the other
//! child collections handled by the reconciler.

use crate::error::{VboxError, VboxResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Flat `key → value` view of a `VBoxManage` output block.
pub type PropertyMap = HashMap<String, String>;

// ─── Configuration ───────────────────────────────────────────────────

/// Runtime configuration shared by every server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VboxConfig {
    /// `VBoxManage` executable (name on `PATH` or absolute path).
    #[serde(default = "default_vboxmanage")]
    pub vboxmanage_path: String,
    /// Time limit for local commands, in seconds. `0` disables it.
    /// Remote commands cannot be cancelled and ignore this value.
    #[serde(default)]
    pub command_timeout_seconds: u64,
    /// Number of raw command transcripts kept per entity.
    #[serde(default = "default_transcript_capacity")]
    pub transcript_capacity: usize,
    /// Interval between background refresh sweeps.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
}

fn default_vboxmanage() -> String {
    "VBoxManage".to_string()
}
fn default_transcript_capacity() -> usize {
    32
}
fn default_poll_interval() -> u64 {
    5
}

impl Default for VboxConfig {
    fn default() -> Self {
        Self {
            vboxmanage_path: default_vboxmanage(),
            command_timeout_seconds: 0,
            transcript_capacity: default_transcript_capacity(),
            poll_interval_seconds: default_poll_interval(),
        }
    }
}

// ─── Run State ───────────────────────────────────────────────────────

/// Lifecycle state of a VM, derived from the `VMState` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Unknown,
    Off,
    Running,
    Paused,
    Saved,
    Aborted,
    Degraded,
}

impl Default for RunState {
    fn default() -> Self {
        Self::Unknown
    }
}

impl RunState {
    /// Map a `VMState` value. Anything unrecognised is `Unknown`.
    pub fn from_vm_state(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "poweroff" | "powered off" => Self::Off,
            "running" => Self::Running,
            "paused" => Self::Paused,
            "saved" => Self::Saved,
            "aborted" | "aborted-saved" => Self::Aborted,
            "gurumeditation" | "guru meditation" | "stuck" => Self::Degraded,
            _ => Self::Unknown,
        }
    }

    /// `Unknown` means the state could not be read; never mutate then.
    pub fn can_mutate(self) -> bool {
        self != Self::Unknown
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Paused)
    }
}

// ─── CLI Vocabularies ────────────────────────────────────────────────

/// Declares an enum together with its exhaustive CLI spelling table.
macro_rules! cli_vocabulary {
    (
        $(#[$meta:meta])*
        $name:ident, $label:literal {
            $($variant:ident => $cli:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "camelCase")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_cli(self) -> &'static str {
                match self {
                    $($name::$variant => $cli),+
                }
            }

            pub fn from_cli(value: &str) -> VboxResult<Self> {
                let v = value.trim();
                $(
                    if v.eq_ignore_ascii_case($cli) {
                        return Ok($name::$variant);
                    }
                )+
                Err(VboxError::unmapped($label, value))
            }
        }

        impl std::str::FromStr for $name {
            type Err = VboxError;

            fn from_str(s: &str) -> VboxResult<Self> {
                Self::from_cli(s)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_cli())
            }
        }
    };
}

cli_vocabulary! {
    /// `modifyvm --firmware`.
    FirmwareType, "firmware type" {
        Bios => "bios",
        Efi => "efi",
        Efi32 => "efi32",
        Efi64 => "efi64",
    }
}

cli_vocabulary! {
    /// `modifyvm --chipset`.
    Chipset, "chipset" {
        Piix3 => "piix3",
        Ich9 => "ich9",
    }
}

cli_vocabulary! {
    /// `modifyvm --graphicscontroller`.
    GraphicsController, "graphics controller" {
        None => "none",
        VboxVga => "vboxvga",
        VmSvga => "vmsvga",
        VboxSvga => "vboxsvga",
    }
}

cli_vocabulary! {
    /// `modifyvm --paravirtprovider`.
    ParavirtProvider, "paravirtualization provider" {
        None => "none",
        Default => "default",
        Legacy => "legacy",
        Minimal => "minimal",
        HyperV => "hyperv",
        Kvm => "kvm",
    }
}

cli_vocabulary! {
    /// `modifyvm --clipboard-mode`.
    ClipboardMode, "clipboard mode" {
        Disabled => "disabled",
        HostToGuest => "hosttoguest",
        GuestToHost => "guesttohost",
        Bidirectional => "bidirectional",
    }
}

cli_vocabulary! {
    /// `modifyvm --drag-and-drop`.
    DragAndDropMode, "drag-and-drop mode" {
        Disabled => "disabled",
        HostToGuest => "hosttoguest",
        GuestToHost => "guesttohost",
        Bidirectional => "bidirectional",
    }
}

cli_vocabulary! {
    /// `modifyvm --boot<N>`.
    BootDevice, "boot device" {
        None => "none",
        Floppy => "floppy",
        Dvd => "dvd",
        Disk => "disk",
        Net => "net",
    }
}

cli_vocabulary! {
    /// `modifyvm --nic<N>`; also the value of the `nic<N>` property.
    NicAttachment, "network attachment" {
        None => "none",
        Null => "null",
        Nat => "nat",
        NatNetwork => "natnetwork",
        Bridged => "bridged",
        Internal => "intnet",
        HostOnly => "hostonly",
        Generic => "generic",
    }
}

cli_vocabulary! {
    /// `modifyvm --nictype<N>`.
    NicType, "network adapter type" {
        Am79C970A => "Am79C970A",
        Am79C973 => "Am79C973",
        Am79C960 => "Am79C960",
        I82540EM => "82540EM",
        I82543GC => "82543GC",
        I82545EM => "82545EM",
        Virtio => "virtio",
    }
}

cli_vocabulary! {
    /// `modifyvm --nicpromisc<N>`.
    PromiscPolicy, "promiscuous mode policy" {
        Deny => "deny",
        AllowVms => "allow-vms",
        AllowAll => "allow-all",
    }
}

cli_vocabulary! {
    /// `startvm --type`.
    StartMode, "start mode" {
        Gui => "gui",
        Headless => "headless",
        Separate => "separate",
    }
}

cli_vocabulary! {
    /// `storagectl --add`.
    StorageBus, "storage bus" {
        Ide => "ide",
        Sata => "sata",
        Scsi => "scsi",
        Sas => "sas",
        Floppy => "floppy",
        Usb => "usb",
        PciE => "pcie",
        Virtio => "virtio",
    }
}

cli_vocabulary! {
    /// `storageattach --type`.
    MediumKind, "medium type" {
        Hdd => "hdd",
        Dvd => "dvddrive",
        Floppy => "fdd",
    }
}

cli_vocabulary! {
    /// `createmedium --format`.
    MediumFormat, "medium format" {
        Vdi => "VDI",
        Vmdk => "VMDK",
        Vhd => "VHD",
    }
}

cli_vocabulary! {
    /// `modifyvm --usb<kind>`.
    UsbControllerKind, "USB controller" {
        Ohci => "ohci",
        Ehci => "ehci",
        Xhci => "xhci",
    }
}

/// Storage controller chipset (`storagectl --controller`).
///
/// The machine-readable `storagecontrollertype<N>` spelling differs from
/// the CLI spelling for some chipsets; both are accepted on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StorageChipset {
    LsiLogic,
    LsiLogicSas,
    BusLogic,
    IntelAhci,
    Piix3,
    Piix4,
    Ich6,
    I82078,
    Usb,
    NVMe,
    VirtioScsi,
}

impl StorageChipset {
    pub const ALL: &'static [StorageChipset] = &[
        Self::LsiLogic,
        Self::LsiLogicSas,
        Self::BusLogic,
        Self::IntelAhci,
        Self::Piix3,
        Self::Piix4,
        Self::Ich6,
        Self::I82078,
        Self::Usb,
        Self::NVMe,
        Self::VirtioScsi,
    ];

    pub fn as_cli(self) -> &'static str {
        match self {
            Self::LsiLogic => "LSILogic",
            Self::LsiLogicSas => "LSILogicSAS",
            Self::BusLogic => "BusLogic",
            Self::IntelAhci => "IntelAHCI",
            Self::Piix3 => "PIIX3",
            Self::Piix4 => "PIIX4",
            Self::Ich6 => "ICH6",
            Self::I82078 => "I82078",
            Self::Usb => "USB",
            Self::NVMe => "NVMe",
            Self::VirtioScsi => "VirtIO",
        }
    }

    fn machine_readable(self) -> &'static str {
        match self {
            Self::LsiLogic => "LsiLogic",
            Self::LsiLogicSas => "LsiLogicSas",
            Self::BusLogic => "BusLogic",
            Self::IntelAhci => "IntelAhci",
            Self::Piix3 => "PIIX3",
            Self::Piix4 => "PIIX4",
            Self::Ich6 => "ICH6",
            Self::I82078 => "I82078",
            Self::Usb => "USB",
            Self::NVMe => "NVMe",
            Self::VirtioScsi => "VirtioSCSI",
        }
    }

    pub fn from_cli(value: &str) -> VboxResult<Self> {
        let v = value.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|c| v.eq_ignore_ascii_case(c.as_cli()) || v.eq_ignore_ascii_case(c.machine_readable()))
            .ok_or_else(|| VboxError::unmapped("storage controller chipset", value))
    }

    /// The bus a controller of this chipset sits on.
    pub fn bus(self) -> StorageBus {
        match self {
            Self::LsiLogic | Self::BusLogic => StorageBus::Scsi,
            Self::LsiLogicSas => StorageBus::Sas,
            Self::IntelAhci => StorageBus::Sata,
            Self::Piix3 | Self::Piix4 | Self::Ich6 => StorageBus::Ide,
            Self::I82078 => StorageBus::Floppy,
            Self::Usb => StorageBus::Usb,
            Self::NVMe => StorageBus::PciE,
            Self::VirtioScsi => StorageBus::Virtio,
        }
    }
}

impl fmt::Display for StorageChipset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_cli())
    }
}

/// `on` / `off` spelling used by `modifyvm`, `storagectl` and `storageattach`.
pub fn on_off(value: bool) -> &'static str {
    if value {
        "on"
    } else {
        "off"
    }
}

/// `yes` / `no` spelling used by `usbfilter`.
pub fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

// ─── Listing Records ─────────────────────────────────────────────────

/// One line of `list vms`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmListEntry {
    pub name: String,
    pub uuid: String,
}

/// A registered medium from `list hdds` / `list dvds` / `list floppies`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Medium {
    pub uuid: String,
    /// `None` for base media (`Parent UUID: base`).
    pub parent_uuid: Option<String>,
    pub state: String,
    pub medium_type: String,
    pub location: String,
    pub format: String,
    pub capacity: String,
    pub in_use_by: Vec<String>,
}

/// A medium with its differencing children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediumNode {
    pub medium: Medium,
    pub children: Vec<MediumNode>,
}

/// A host USB device from `list usbhost`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbDevice {
    pub uuid: String,
    pub vendor_id: String,
    pub product_id: String,
    pub revision: String,
    pub manufacturer: String,
    pub product: String,
    pub serial_number: String,
    pub address: String,
    pub state: String,
}

/// A guest OS type from `list ostypes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsType {
    pub id: String,
    pub description: String,
    pub family_id: String,
    pub family_description: String,
    pub is_64_bit: bool,
}

/// A host network interface from `list bridgedifs` / `list hostonlyifs`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostInterface {
    pub name: String,
    pub guid: String,
    pub dhcp: bool,
    pub ip_address: String,
    pub network_mask: String,
    pub ipv6_address: String,
    pub hardware_address: String,
    pub medium_type: String,
    pub status: String,
    pub wireless: bool,
    pub network_name: String,
}

/// An installed extension pack from `list extpacks`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtensionPack {
    pub name: String,
    pub version: String,
    pub revision: String,
    pub edition: String,
    pub description: String,
    pub usable: bool,
    pub why_unusable: String,
}

/// A snapshot and its children, from `snapshot list --machinereadable`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotNode {
    pub name: String,
    pub uuid: String,
    pub description: String,
    pub is_current: bool,
    pub children: Vec<SnapshotNode>,
}

/// Network adapter summary from the human-readable `showvminfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NicSummary {
    pub slot: u32,
    pub enabled: bool,
    pub mac: String,
    /// e.g. `Bridged Interface 'eth0'`.
    pub attachment: String,
    /// The quoted name inside `attachment`, if any.
    pub attachment_name: String,
    pub cable_connected: bool,
    pub adapter_type: String,
    pub promisc_policy: String,
}

// ─── Transcripts ─────────────────────────────────────────────────────

/// One command as it was sent and what came back, kept for diagnostics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transcript {
    pub at: DateTime<Utc>,
    pub command: String,
    pub exit_code: Option<i32>,
    pub lines: Vec<String>,
    pub ok: bool,
}

// ─── Storage Graph ───────────────────────────────────────────────────

/// A storage controller and the media attached to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageController {
    pub name: String,
    /// Name under which the controller was observed. Editors keep this
    /// while changing `name`, so a rename is matched as the same
    /// controller instead of remove + add.
    #[serde(default)]
    pub original_name: Option<String>,
    /// `None` when the host reports a controller type not listed in
    /// [`StorageChipset`]; `reported_type` then carries the raw value.
    #[serde(default)]
    pub chipset: Option<StorageChipset>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reported_type: Option<String>,
    #[serde(default)]
    pub bootable: bool,
    #[serde(default)]
    pub port_count: Option<u32>,
    #[serde(default)]
    pub media: Vec<StorageMedium>,
}

impl StorageController {
    pub fn new(name: impl Into<String>, chipset: StorageChipset) -> Self {
        Self {
            name: name.into(),
            original_name: None,
            chipset: Some(chipset),
            reported_type: None,
            bootable: true,
            port_count: None,
            media: Vec::new(),
        }
    }

    /// A controller of an unknown type was observed on the host and can
    /// be kept, modified or removed but not created.
    pub fn unrecognised(name: impl Into<String>, reported_type: impl Into<String>) -> Self {
        Self {
            chipset: None,
            reported_type: Some(reported_type.into()),
            ..Self::new(name, StorageChipset::IntelAhci)
        }
    }

    pub fn bus(&self) -> Option<StorageBus> {
        self.chipset.map(StorageChipset::bus)
    }

    /// Chipset as shown to users, falling back to the reported type.
    pub fn type_label(&self) -> &str {
        match (self.chipset, &self.reported_type) {
            (Some(chipset), _) => chipset.as_cli(),
            (None, Some(raw)) => raw,
            (None, None) => "unknown",
        }
    }

    /// Name the controller currently has on the remote side.
    pub fn observed_name(&self) -> &str {
        self.original_name.as_deref().unwrap_or(&self.name)
    }

    pub fn with_medium(mut self, medium: StorageMedium) -> Self {
        self.media.push(medium);
        self
    }
}

/// A medium attachment at a port/device coordinate of one controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMedium {
    pub port: u32,
    pub device: u32,
    pub kind: MediumKind,
    /// Image path; `None` for an empty optical/floppy drive.
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub image_uuid: Option<String>,
    #[serde(default)]
    pub nonrotational: bool,
    #[serde(default)]
    pub hot_pluggable: bool,
    #[serde(default)]
    pub discard: bool,
    /// Eject-on-boot for optical drives (`--tempeject`).
    #[serde(default)]
    pub temp_eject: bool,
}

impl StorageMedium {
    pub fn new(port: u32, device: u32, kind: MediumKind, location: Option<String>) -> Self {
        Self {
            port,
            device,
            kind,
            location,
            image_uuid: None,
            nonrotational: false,
            hot_pluggable: false,
            discard: false,
            temp_eject: false,
        }
    }

    /// Value for `storageattach --medium`.
    pub fn medium_argument(&self) -> String {
        match (&self.location, &self.image_uuid) {
            (Some(path), _) => path.clone(),
            (None, Some(uuid)) => uuid.clone(),
            (None, None) => "emptydrive".to_string(),
        }
    }
}

// ─── Other Child Collections ─────────────────────────────────────────

/// A VM USB device filter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsbFilter {
    /// Zero-based position on the remote side; `None` for new filters.
    #[serde(default)]
    pub index: Option<u32>,
    pub name: String,
    pub active: bool,
    #[serde(default)]
    pub vendor_id: String,
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub revision: String,
    #[serde(default)]
    pub manufacturer: String,
    #[serde(default)]
    pub product: String,
    #[serde(default)]
    pub serial_number: String,
    #[serde(default)]
    pub remote: String,
}

/// A VM shared folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFolder {
    pub name: String,
    pub host_path: String,
    #[serde(default)]
    pub read_only: bool,
    #[serde(default)]
    pub auto_mount: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_state_maps_known_values() {
        assert_eq!(RunState::from_vm_state("poweroff"), RunState::Off);
        assert_eq!(RunState::from_vm_state("running"), RunState::Running);
        assert_eq!(RunState::from_vm_state("paused"), RunState::Paused);
        assert_eq!(RunState::from_vm_state("saved"), RunState::Saved);
        assert_eq!(RunState::from_vm_state("aborted"), RunState::Aborted);
        assert_eq!(RunState::from_vm_state("gurumeditation"), RunState::Degraded);
    }

    #[test]
    fn run_state_unmapped_is_unknown() {
        assert_eq!(RunState::from_vm_state("teleporting"), RunState::Unknown);
        assert_eq!(RunState::from_vm_state(""), RunState::Unknown);
        assert!(!RunState::Unknown.can_mutate());
        assert!(RunState::Off.can_mutate());
    }

    #[test]
    fn vocabulary_round_trips_every_variant() {
        for nic in NicAttachment::ALL {
            assert_eq!(NicAttachment::from_cli(nic.as_cli()).unwrap(), *nic);
        }
        for chip in StorageChipset::ALL {
            assert_eq!(StorageChipset::from_cli(chip.as_cli()).unwrap(), *chip);
        }
    }

    #[test]
    fn vocabulary_rejects_unknown_spelling() {
        let err = "wifi".parse::<NicAttachment>().unwrap_err();
        assert_eq!(err.kind, crate::error::VboxErrorKind::UnmappedValue);
        assert!(GraphicsController::from_cli("vga9000").is_err());
    }

    #[test]
    fn chipset_accepts_machine_readable_spelling() {
        assert_eq!(StorageChipset::from_cli("IntelAhci").unwrap(), StorageChipset::IntelAhci);
        assert_eq!(StorageChipset::from_cli("VirtioSCSI").unwrap(), StorageChipset::VirtioScsi);
        assert_eq!(StorageChipset::IntelAhci.bus(), StorageBus::Sata);
        assert_eq!(StorageChipset::Piix4.bus(), StorageBus::Ide);
    }

    #[test]
    fn medium_argument_prefers_path_then_uuid() {
        let mut m = StorageMedium::new(0, 0, MediumKind::Dvd, None);
        assert_eq!(m.medium_argument(), "emptydrive");
        m.image_uuid = Some("b1".into());
        assert_eq!(m.medium_argument(), "b1");
        m.location = Some("/iso/a.iso".into());
        assert_eq!(m.medium_argument(), "/iso/a.iso");
    }

    #[test]
    fn config_defaults() {
        let cfg: VboxConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.vboxmanage_path, "VBoxManage");
        assert_eq!(cfg.transcript_capacity, 32);
        assert_eq!(cfg.poll_interval_seconds, 5);
        assert_eq!(cfg.command_timeout_seconds, 0);
    }
}
