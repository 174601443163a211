//! Parsers for the `VBoxManage` output dialects.
//!
//! Every parser is a pure function from output lines to a structured value.
//! Lines no rule recognises are skipped; the only failures are consistency
//! faults found after parsing (e.g. a medium whose parent is missing).

mod colon;
mod machinereadable;
mod markers;
mod records;

pub use colon::{parse_colon_fields, parse_vm_list};
pub use machinereadable::{parse_machine_readable, snapshot_tree};
pub use markers::{parse_version, ProgressTracker, COMPLETE_MARKER, STARTED_MARKER};
pub use records::{
    media_tree, parse_ext_packs, parse_extended, parse_host_interfaces, parse_media,
    parse_os_types, parse_usb_hosts, RecordParser,
};

/// Split captured text into lines the way the transport does.
pub fn split_lines(text: &str) -> Vec<String> {
    text.split('\n')
        .map(|l| l.trim_end_matches('\r').to_string())
        .collect()
}
