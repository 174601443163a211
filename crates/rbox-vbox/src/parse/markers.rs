//! Scalars and completion markers.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// `startvm` prints this once the VM process is up.
    pub static ref STARTED_MARKER: Regex =
        Regex::new(r"successfully started").expect("valid started regex");
    /// Final step of a progress stream.
    pub static ref COMPLETE_MARKER: Regex = Regex::new(r"100%").expect("valid complete regex");
    static ref VERSION: Regex =
        Regex::new(r"^\s*(\d+\.\d+\.\d+\S*)\s*$").expect("valid version regex");
    static ref PERCENT: Regex = Regex::new(r"(\d{1,3})%").expect("valid percent regex");
}

/// `VBoxManage --version`, e.g. `7.0.12r159484`.
pub fn parse_version<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    lines
        .iter()
        .find_map(|l| VERSION.captures(l.as_ref()).map(|c| c[1].to_string()))
}

/// Follows a `0%...10%...100%` stream fed in arbitrary chunks.
///
/// Digits at the end of a chunk are held back until the next chunk shows
/// whether they belong to a percentage.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    carry: String,
    last: Option<u8>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk; returns the latest percentage if it changed.
    pub fn push(&mut self, chunk: &[u8]) -> Option<u8> {
        let mut text = std::mem::take(&mut self.carry);
        text.push_str(&String::from_utf8_lossy(chunk));

        let mut latest = None;
        let mut consumed = 0;
        for c in PERCENT.captures_iter(&text) {
            if let Ok(n) = c[1].parse::<u16>() {
                latest = Some(n.min(100) as u8);
            }
            if let Some(m) = c.get(0) {
                consumed = m.end();
            }
        }

        let tail = &text[consumed..];
        let digits = tail.len() - tail.trim_end_matches(|c: char| c.is_ascii_digit()).len();
        self.carry = tail[tail.len() - digits..].to_string();

        match latest {
            Some(p) if self.last != Some(p) => {
                self.last = Some(p);
                Some(p)
            }
            _ => None,
        }
    }

    pub fn last(&self) -> Option<u8> {
        self.last
    }

    pub fn is_complete(&self) -> bool {
        self.last == Some(100)
    }
}
