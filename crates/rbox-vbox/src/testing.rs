//! Scripted [`CommandRunner`] for tests.
//!
//! Replays canned output for commands whose argument line starts with a
//! registered prefix and records every command issued. Unmatched commands
//! succeed silently.

use crate::error::VboxResult;
use crate::transport::{CommandRunner, LiveOutput, RawOutput};
use async_trait::async_trait;
use rbox_ssh::OutputStream;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Clone)]
struct Rule {
    prefix: String,
    exit_code: i32,
    stdout: String,
    stderr: String,
    once: bool,
}

#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    issued: Mutex<Vec<Vec<String>>>,
    delay: Mutex<Option<Duration>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answer every command starting with `prefix` on stdout.
    pub fn respond(&self, prefix: &str, exit_code: i32, stdout: &str) {
        self.push(prefix, exit_code, stdout, "", false);
    }

    /// Answer every command starting with `prefix` on stderr.
    pub fn respond_stderr(&self, prefix: &str, exit_code: i32, stderr: &str) {
        self.push(prefix, exit_code, "", stderr, false);
    }

    /// Answer the next matching command only; later ones fall through.
    pub fn respond_once(&self, prefix: &str, exit_code: i32, stdout: &str) {
        self.push(prefix, exit_code, stdout, "", true);
    }

    fn push(&self, prefix: &str, exit_code: i32, stdout: &str, stderr: &str, once: bool) {
        lock(&self.rules).push(Rule {
            prefix: prefix.to_string(),
            exit_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            once,
        });
    }

    /// Hold every command this long before answering.
    pub fn set_delay(&self, delay: Duration) {
        *lock(&self.delay) = Some(delay);
    }

    /// Argument vectors of every command issued so far.
    pub fn issued(&self) -> Vec<Vec<String>> {
        lock(&self.issued).clone()
    }

    /// Issued commands with arguments joined by spaces.
    pub fn issued_lines(&self) -> Vec<String> {
        self.issued().iter().map(|a| a.join(" ")).collect()
    }

    /// Number of issued commands starting with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.issued_lines()
            .iter()
            .filter(|l| l.starts_with(prefix))
            .count()
    }

    fn answer(&self, line: &str) -> Rule {
        let mut rules = lock(&self.rules);
        // Later registrations override earlier ones.
        match rules.iter().rposition(|r| line.starts_with(&r.prefix)) {
            Some(i) if rules[i].once => rules.remove(i),
            Some(i) => rules[i].clone(),
            None => Rule {
                prefix: String::new(),
                exit_code: 0,
                stdout: String::new(),
                stderr: String::new(),
                once: false,
            },
        }
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, _program: &str, args: &[String], live: LiveOutput) -> VboxResult<RawOutput> {
        lock(&self.issued).push(args.to_vec());
        let rule = self.answer(&args.join(" "));

        let delay = *lock(&self.delay);
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }

        if !rule.stdout.is_empty() {
            live.emit(OutputStream::Stdout, rule.stdout.as_bytes());
        }
        if !rule.stderr.is_empty() {
            live.emit(OutputStream::Stderr, rule.stderr.as_bytes());
        }
        Ok(RawOutput {
            stdout: rule.stdout.into_bytes(),
            stderr: rule.stderr.into_bytes(),
            exit_code: Some(rule.exit_code),
        })
    }

    fn describe(&self) -> String {
        "scripted".to_string()
    }
}
