//! Single-line dialects: `Key: value` fields and `"name" {uuid}` lists.

use crate::types::{PropertyMap, VmListEntry};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref COLON_FIELD: Regex = Regex::new(r"^([^:]+?):\s*(.*?)\s*$").expect("valid field regex");
    static ref VM_LINE: Regex =
        Regex::new(r#"^"(.*)"\s+\{([0-9A-Fa-f\-]+)\}\s*$"#).expect("valid vm list regex");
}

/// `list systemproperties` / `list hostinfo`: one `Key: value` per line.
///
/// Keys are trimmed; a repeated key keeps its last value.
pub fn parse_colon_fields<S: AsRef<str>>(lines: &[S]) -> PropertyMap {
    lines
        .iter()
        .filter_map(|l| COLON_FIELD.captures(l.as_ref()))
        .map(|c| (c[1].trim().to_string(), c[2].to_string()))
        .filter(|(k, _)| !k.is_empty())
        .collect()
}

/// `list vms` / `list runningvms`.
pub fn parse_vm_list<S: AsRef<str>>(lines: &[S]) -> Vec<VmListEntry> {
    lines
        .iter()
        .filter_map(|l| VM_LINE.captures(l.as_ref().trim()))
        .map(|c| VmListEntry {
            name: c[1].to_string(),
            uuid: c[2].to_string(),
        })
        .collect()
}
