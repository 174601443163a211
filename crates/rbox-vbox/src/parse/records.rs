//! Human-readable record blocks: `list hdds`, `list usbhost`, `list ostypes`,
//! `list bridgedifs`, `list extpacks`, and the NIC/audio/USB lines of the
//! plain `showvminfo` output.

use crate::error::{VboxError, VboxResult};
use crate::types::{
    ExtensionPack, HostInterface, Medium, MediumNode, OsType, PropertyMap, UsbDevice,
};
use lazy_static::lazy_static;
use log::error;
use regex::Regex;
use std::collections::{HashMap, HashSet};

// ─── Generic Record Parser ───────────────────────────────────────────

/// Splits output into records and pulls named fields out of each line.
///
/// A record ends at a blank line or when its start field appears again.
/// Each rule's first capture group becomes the field value.
pub struct RecordParser {
    start: &'static str,
    rules: Vec<(&'static str, Regex)>,
}

impl RecordParser {
    /// Rules given as `(field, regex)`.
    pub fn new(start: &'static str, rules: Vec<(&'static str, Regex)>) -> Self {
        Self { start, rules }
    }

    /// Rules given as `(field, label)`, matching `Label:   value` lines.
    pub fn labelled(start: &'static str, labels: &[(&'static str, &str)]) -> Self {
        let rules = labels
            .iter()
            .filter_map(|(field, label)| {
                Regex::new(&format!(r"^\s*{}:\s*(.*?)\s*$", regex::escape(label)))
                    .ok()
                    .map(|re| (*field, re))
            })
            .collect();
        Self::new(start, rules)
    }

    pub fn parse<S: AsRef<str>>(&self, lines: &[S]) -> Vec<PropertyMap> {
        let mut records = Vec::new();
        let mut current = PropertyMap::new();

        for line in lines.iter().map(AsRef::as_ref) {
            if line.trim().is_empty() {
                if !current.is_empty() {
                    records.push(std::mem::take(&mut current));
                }
                continue;
            }
            let Some((field, value)) = self.match_line(line) else {
                continue;
            };
            if field == self.start && current.contains_key(self.start) {
                records.push(std::mem::take(&mut current));
            }
            current.insert(field.to_string(), value);
        }
        if !current.is_empty() {
            records.push(current);
        }
        records
    }

    fn match_line(&self, line: &str) -> Option<(&'static str, String)> {
        self.rules.iter().find_map(|(field, re)| {
            re.captures(line)
                .and_then(|c| c.get(1))
                .map(|m| (*field, m.as_str().to_string()))
        })
    }
}

fn field(map: &PropertyMap, key: &str) -> String {
    map.get(key).cloned().unwrap_or_default()
}

fn flag(map: &PropertyMap, key: &str) -> bool {
    matches!(
        map.get(key).map(|v| v.to_ascii_lowercase()).as_deref(),
        Some("yes" | "true" | "enabled" | "on")
    )
}

lazy_static! {
    static ref MEDIA: RecordParser = RecordParser::labelled(
        "uuid",
        &[
            ("uuid", "UUID"),
            ("parent", "Parent UUID"),
            ("state", "State"),
            ("type", "Type"),
            ("location", "Location"),
            ("format", "Storage format"),
            ("capacity", "Capacity"),
            ("inuse", "In use by VMs"),
        ],
    );
    static ref USB_HOSTS: RecordParser = RecordParser::labelled(
        "uuid",
        &[
            ("uuid", "UUID"),
            ("vendor", "VendorId"),
            ("product_id", "ProductId"),
            ("revision", "Revision"),
            ("manufacturer", "Manufacturer"),
            ("product", "Product"),
            ("serial", "SerialNumber"),
            ("address", "Address"),
            ("state", "Current State"),
        ],
    );
    static ref OS_TYPES: RecordParser = RecordParser::labelled(
        "id",
        &[
            ("id", "ID"),
            ("description", "Description"),
            ("family_id", "Family ID"),
            ("family_desc", "Family Desc"),
            ("64bit", "64 bit"),
        ],
    );
    static ref HOST_IFS: RecordParser = RecordParser::labelled(
        "name",
        &[
            ("name", "Name"),
            ("guid", "GUID"),
            ("dhcp", "DHCP"),
            ("ip", "IPAddress"),
            ("mask", "NetworkMask"),
            ("ipv6", "IPV6Address"),
            ("mac", "HardwareAddress"),
            ("medium", "MediumType"),
            ("wireless", "Wireless"),
            ("status", "Status"),
            ("network", "VBoxNetworkName"),
        ],
    );
    static ref EXT_PACKS: RecordParser = RecordParser::new(
        "name",
        vec![
            ("name", Regex::new(r"^Pack no\.\s*\d+:\s*(.*?)\s*$").expect("valid pack regex")),
            ("version", Regex::new(r"^Version:\s*(.*?)\s*$").expect("valid version regex")),
            ("revision", Regex::new(r"^Revision:\s*(.*?)\s*$").expect("valid revision regex")),
            ("edition", Regex::new(r"^Edition:\s*(.*?)\s*$").expect("valid edition regex")),
            ("description", Regex::new(r"^Description:\s*(.*?)\s*$").expect("valid description regex")),
            ("usable", Regex::new(r"^Usable:\s*(.*?)\s*$").expect("valid usable regex")),
            ("why", Regex::new(r"^Why unusable:\s*(.*?)\s*$").expect("valid reason regex")),
        ],
    );
}

// ─── Media ───────────────────────────────────────────────────────────

/// `list hdds` / `list dvds` / `list floppies`.
pub fn parse_media<S: AsRef<str>>(lines: &[S]) -> Vec<Medium> {
    MEDIA
        .parse(lines)
        .into_iter()
        .filter(|r| r.contains_key("uuid"))
        .map(|r| {
            let parent = field(&r, "parent");
            Medium {
                uuid: field(&r, "uuid"),
                parent_uuid: match parent.as_str() {
                    "" | "base" => None,
                    _ => Some(parent),
                },
                state: field(&r, "state"),
                medium_type: field(&r, "type"),
                location: field(&r, "location"),
                format: field(&r, "format"),
                capacity: field(&r, "capacity"),
                in_use_by: r
                    .get("inuse")
                    .map(|v| {
                        v.split(',')
                            .map(|s| s.trim().to_string())
                            .filter(|s| !s.is_empty())
                            .collect()
                    })
                    .unwrap_or_default(),
            }
        })
        .collect()
}

/// Arrange media into backing chains.
///
/// A medium naming a parent that is not in the list (or a chain that never
/// reaches a base medium) is a consistency fault: each one is logged and
/// the whole tree is rejected.
pub fn media_tree(media: &[Medium]) -> VboxResult<Vec<MediumNode>> {
    let known: HashSet<&str> = media.iter().map(|m| m.uuid.as_str()).collect();
    let mut children: HashMap<&str, Vec<&Medium>> = HashMap::new();
    let mut roots = Vec::new();
    let mut faults = Vec::new();

    for m in media {
        match m.parent_uuid.as_deref() {
            None => roots.push(m),
            Some(parent) if known.contains(parent) => {
                children.entry(parent).or_default().push(m);
            }
            Some(parent) => {
                error!(
                    "Medium {} ({}) references unknown parent {}",
                    m.uuid, m.location, parent
                );
                faults.push(format!("{} -> {}", m.uuid, parent));
            }
        }
    }

    fn build<'a>(
        m: &'a Medium,
        children: &HashMap<&str, Vec<&'a Medium>>,
        placed: &mut usize,
    ) -> MediumNode {
        *placed += 1;
        let kids = children
            .get(m.uuid.as_str())
            .map(|list| list.iter().map(|c| build(*c, children, placed)).collect())
            .unwrap_or_default();
        MediumNode {
            medium: m.clone(),
            children: kids,
        }
    }

    let mut placed = 0usize;
    let tree: Vec<MediumNode> = roots
        .into_iter()
        .map(|r| build(r, &children, &mut placed))
        .collect();

    if faults.is_empty() && placed < media.len() {
        error!(
            "{} media are not reachable from any base medium",
            media.len() - placed
        );
        faults.push("parent cycle".to_string());
    }

    if faults.is_empty() {
        Ok(tree)
    } else {
        Err(VboxError::consistency("Medium list has unresolved parents").with_lines(faults))
    }
}

// ─── Other Listings ──────────────────────────────────────────────────

/// `list usbhost`.
pub fn parse_usb_hosts<S: AsRef<str>>(lines: &[S]) -> Vec<UsbDevice> {
    USB_HOSTS
        .parse(lines)
        .into_iter()
        .filter(|r| r.contains_key("uuid"))
        .map(|r| UsbDevice {
            uuid: field(&r, "uuid"),
            vendor_id: field(&r, "vendor"),
            product_id: field(&r, "product_id"),
            revision: field(&r, "revision"),
            manufacturer: field(&r, "manufacturer"),
            product: field(&r, "product"),
            serial_number: field(&r, "serial"),
            address: field(&r, "address"),
            state: field(&r, "state"),
        })
        .collect()
}

/// `list ostypes`.
pub fn parse_os_types<S: AsRef<str>>(lines: &[S]) -> Vec<OsType> {
    OS_TYPES
        .parse(lines)
        .into_iter()
        .filter(|r| r.contains_key("id"))
        .map(|r| OsType {
            id: field(&r, "id"),
            description: field(&r, "description"),
            family_id: field(&r, "family_id"),
            family_description: field(&r, "family_desc"),
            is_64_bit: flag(&r, "64bit"),
        })
        .collect()
}

/// `list bridgedifs` / `list hostonlyifs`.
pub fn parse_host_interfaces<S: AsRef<str>>(lines: &[S]) -> Vec<HostInterface> {
    HOST_IFS
        .parse(lines)
        .into_iter()
        .filter(|r| r.contains_key("name"))
        .map(|r| HostInterface {
            name: field(&r, "name"),
            guid: field(&r, "guid"),
            dhcp: flag(&r, "dhcp"),
            ip_address: field(&r, "ip"),
            network_mask: field(&r, "mask"),
            ipv6_address: field(&r, "ipv6"),
            hardware_address: field(&r, "mac"),
            medium_type: field(&r, "medium"),
            status: field(&r, "status"),
            wireless: flag(&r, "wireless"),
            network_name: field(&r, "network"),
        })
        .collect()
}

/// `list extpacks`.
pub fn parse_ext_packs<S: AsRef<str>>(lines: &[S]) -> Vec<ExtensionPack> {
    EXT_PACKS
        .parse(lines)
        .into_iter()
        .filter(|r| r.contains_key("name"))
        .map(|r| ExtensionPack {
            name: field(&r, "name"),
            version: field(&r, "version"),
            revision: field(&r, "revision"),
            edition: field(&r, "edition"),
            description: field(&r, "description"),
            usable: flag(&r, "usable"),
            why_unusable: field(&r, "why"),
        })
        .collect()
}

// ─── Extended VM Info ────────────────────────────────────────────────

lazy_static! {
    static ref NIC_LINE: Regex = Regex::new(r"^NIC (\d+):\s+(.*?)\s*$").expect("valid nic regex");
    static ref NIC_MAC: Regex = Regex::new(r"MAC: ([0-9A-Fa-f]{12})").expect("valid mac regex");
    static ref NIC_ATTACHMENT: Regex = Regex::new(r"Attachment: ([^,]*)").expect("valid attachment regex");
    static ref QUOTED_NAME: Regex = Regex::new(r"'([^']*)'").expect("valid quoted name regex");
    static ref NIC_CABLE: Regex = Regex::new(r"Cable connected: (on|off)").expect("valid cable regex");
    static ref NIC_TYPE: Regex = Regex::new(r"Type: ([^,]+)").expect("valid type regex");
    static ref NIC_PROMISC: Regex = Regex::new(r"Promisc Policy: ([^,]+)").expect("valid promisc regex");
    static ref AUDIO_LINE: Regex = Regex::new(r"^Audio:\s+(.*?)\s*$").expect("valid audio regex");
    static ref USB_LINE: Regex =
        Regex::new(r"^(OHCI|EHCI|xHCI) USB:\s+(\S+)").expect("valid usb regex");
}

fn capture(re: &Regex, text: &str) -> Option<String> {
    re.captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Plain `showvminfo` lines the machine-readable form lacks, under `ext.*`
/// keys, meant to be merged into an existing property map.
pub fn parse_extended<S: AsRef<str>>(lines: &[S]) -> PropertyMap {
    let mut map = PropertyMap::new();
    for line in lines.iter().map(AsRef::as_ref) {
        if let Some(c) = NIC_LINE.captures(line) {
            let prefix = format!("ext.nic{}", &c[1]);
            let body = &c[2];
            let enabled = !body.eq_ignore_ascii_case("disabled");
            map.insert(format!("{}.enabled", prefix), enabled.to_string());
            if !enabled {
                continue;
            }
            if let Some(mac) = capture(&NIC_MAC, body) {
                map.insert(format!("{}.mac", prefix), mac);
            }
            if let Some(attachment) = capture(&NIC_ATTACHMENT, body) {
                if let Some(name) = capture(&QUOTED_NAME, &attachment) {
                    map.insert(format!("{}.attachmentName", prefix), name);
                }
                map.insert(format!("{}.attachment", prefix), attachment);
            }
            if let Some(cable) = capture(&NIC_CABLE, body) {
                map.insert(format!("{}.cable", prefix), cable);
            }
            if let Some(kind) = capture(&NIC_TYPE, body) {
                map.insert(format!("{}.type", prefix), kind);
            }
            if let Some(policy) = capture(&NIC_PROMISC, body) {
                map.insert(format!("{}.promisc", prefix), policy);
            }
        } else if let Some(c) = AUDIO_LINE.captures(line) {
            let value = c[1].to_string();
            let enabled = value.starts_with("enabled");
            map.insert("ext.audio.enabled".to_string(), enabled.to_string());
            map.insert("ext.audio".to_string(), value);
        } else if let Some(c) = USB_LINE.captures(line) {
            map.insert(
                format!("ext.usb.{}", c[1].to_ascii_lowercase()),
                c[2].to_string(),
            );
        }
    }
    map
}
