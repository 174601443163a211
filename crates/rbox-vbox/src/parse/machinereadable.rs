//! `--machinereadable` output: `key="value"` or `key=bare` lines.
//!
//! Free-text keys (`description`, `SnapshotDescription*`) may span several
//! lines. Such a value opens with a quote and continues over following
//! lines until one ends in an unescaped closing quote. A blank line or a
//! line that parses as a new key ends the continuation early.

use crate::types::{PropertyMap, SnapshotNode};
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref KEY_LINE: Regex =
        Regex::new(r#"^(?:"([^"]+)"|([A-Za-z0-9_./:\-]+))=(.*)$"#).expect("valid key regex");
}

fn is_free_text(key: &str) -> bool {
    key == "description" || key.starts_with("SnapshotDescription")
}

/// `true` if `s` ends in a `"` not escaped by a backslash.
fn ends_with_closing_quote(s: &str) -> bool {
    let Some(body) = s.strip_suffix('"') else {
        return false;
    };
    let backslashes = body.chars().rev().take_while(|c| *c == '\\').count();
    backslashes % 2 == 0
}

fn unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some(next @ ('"' | '\\')) => out.push(next),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

fn unquote(raw: &str) -> String {
    if raw.len() >= 2 && raw.starts_with('"') && ends_with_closing_quote(raw) {
        unescape(&raw[1..raw.len() - 1])
    } else {
        raw.trim().to_string()
    }
}

/// Parse `--machinereadable` lines into a property map.
pub fn parse_machine_readable<S: AsRef<str>>(lines: &[S]) -> PropertyMap {
    let mut map = PropertyMap::new();
    // Key and accumulated raw text of an open multi-line value.
    let mut open: Option<(String, String)> = None;

    for line in lines.iter().map(AsRef::as_ref) {
        if line.trim().is_empty() {
            if let Some((key, value)) = open.take() {
                map.insert(key, unescape(&value));
            }
            continue;
        }

        if let Some(caps) = KEY_LINE.captures(line) {
            if let Some((key, value)) = open.take() {
                map.insert(key, unescape(&value));
            }
            let key = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();
            let raw = caps.get(3).map(|m| m.as_str()).unwrap_or_default();

            let opens = raw.starts_with('"') && (raw.len() == 1 || !ends_with_closing_quote(raw));
            if is_free_text(&key) && opens {
                open = Some((key, raw[1..].to_string()));
            } else {
                map.insert(key, unquote(raw));
            }
            continue;
        }

        if let Some((key, value)) = open.as_mut() {
            value.push('\n');
            if ends_with_closing_quote(line) {
                value.push_str(&line[..line.len() - 1]);
                let key = std::mem::take(key);
                let value = std::mem::take(value);
                map.insert(key, unescape(&value));
                open = None;
            } else {
                value.push_str(line);
            }
        }
    }

    if let Some((key, value)) = open {
        map.insert(key, unescape(&value));
    }
    map
}

// ─── Snapshot Tree ───────────────────────────────────────────────────

/// Build the snapshot tree from `snapshot <vm> list --machinereadable`.
///
/// Nodes are keyed by suffix: the root is `SnapshotName`, its children
/// `SnapshotName-1`, `SnapshotName-2`, grandchildren `SnapshotName-1-1`.
pub fn snapshot_tree(map: &PropertyMap) -> Option<SnapshotNode> {
    let current = map.get("CurrentSnapshotUUID").map(String::as_str);
    snapshot_node(map, "", current)
}

fn snapshot_node(map: &PropertyMap, suffix: &str, current: Option<&str>) -> Option<SnapshotNode> {
    let name = map.get(&format!("SnapshotName{}", suffix))?;
    let uuid = map
        .get(&format!("SnapshotUUID{}", suffix))
        .cloned()
        .unwrap_or_default();
    let description = map
        .get(&format!("SnapshotDescription{}", suffix))
        .cloned()
        .unwrap_or_default();

    let mut children = Vec::new();
    for i in 1.. {
        match snapshot_node(map, &format!("{}-{}", suffix, i), current) {
            Some(child) => children.push(child),
            None => break,
        }
    }

    Some(SnapshotNode {
        name: name.clone(),
        is_current: current == Some(uuid.as_str()),
        uuid,
        description,
        children,
    })
}
