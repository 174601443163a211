//! Command transport for `VBoxManage`.
//!
//! The same logical command runs either as a local process
//! (`tokio::process`) or over an SSH channel (`rbox-ssh`). Both paths
//! produce the same [`CommandOutput`]: stdout and stderr captured in full,
//! then merged (stderr after stdout) and split into lines.

use crate::error::{VboxError, VboxResult};
use crate::parse::split_lines;
use crate::types::VboxConfig;
use async_trait::async_trait;
use log::{debug, trace, warn};
use rbox_ssh::{OutputStream, SshError, SshSession};
use regex::Regex;
use std::borrow::Cow;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc::UnboundedSender;

// ─── Output ──────────────────────────────────────────────────────────

/// Bytes as they came back from a runner.
#[derive(Debug, Clone, Default)]
pub struct RawOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
}

/// Result of one `VBoxManage` invocation.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Command line as it was issued, for logs and transcripts.
    pub command: String,
    /// Merged output split on newlines. Never empty: a silent command
    /// yields a single empty line.
    pub lines: Vec<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    pub fn from_raw(command: String, raw: RawOutput) -> Self {
        let stdout = String::from_utf8_lossy(&raw.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&raw.stderr).into_owned();
        let lines = merge_lines(&stdout, &stderr);
        Self {
            command,
            lines,
            stdout,
            stderr,
            exit_code: raw.exit_code,
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Whether every output line is blank.
    pub fn is_silent(&self) -> bool {
        self.lines.iter().all(|l| l.trim().is_empty())
    }

    /// Non-zero exit becomes `CommandFailed` carrying the output lines.
    pub fn check_ok(&self) -> VboxResult<()> {
        if self.success() {
            return Ok(());
        }
        Err(VboxError::command_failed(
            &self.command,
            self.exit_code.unwrap_or(-1),
            self.lines.clone(),
        ))
    }

    /// Exit zero and `marker` present somewhere in the output.
    pub fn check_marker(&self, marker: &Regex) -> VboxResult<()> {
        self.check_ok()?;
        if self.lines.iter().any(|l| marker.is_match(l)) {
            Ok(())
        } else {
            Err(VboxError::marker_missing(
                &self.command,
                marker.as_str(),
                self.lines.clone(),
            ))
        }
    }

    /// Exit zero and no output at all.
    pub fn check_silent(&self) -> VboxResult<()> {
        self.check_ok()?;
        if self.is_silent() {
            Ok(())
        } else {
            Err(VboxError::unexpected_output(&self.command, self.lines.clone()))
        }
    }
}

fn merge_lines(stdout: &str, stderr: &str) -> Vec<String> {
    let mut merged = String::with_capacity(stdout.len() + stderr.len() + 1);
    merged.push_str(stdout);
    if !stdout.is_empty() && !stdout.ends_with('\n') && !stderr.is_empty() {
        merged.push('\n');
    }
    merged.push_str(stderr);
    split_lines(&merged)
}

// ─── Live Output ─────────────────────────────────────────────────────

/// Optional sinks receiving output chunks while the command runs.
#[derive(Debug, Clone, Default)]
pub struct LiveOutput {
    pub stdout: Option<UnboundedSender<Vec<u8>>>,
    pub stderr: Option<UnboundedSender<Vec<u8>>>,
}

impl LiveOutput {
    pub fn none() -> Self {
        Self::default()
    }

    /// Send both streams to the same sink.
    pub fn both(sink: UnboundedSender<Vec<u8>>) -> Self {
        Self {
            stdout: Some(sink.clone()),
            stderr: Some(sink),
        }
    }

    pub fn emit(&self, stream: OutputStream, chunk: &[u8]) {
        let sink = match stream {
            OutputStream::Stdout => &self.stdout,
            OutputStream::Stderr => &self.stderr,
        };
        if let Some(tx) = sink {
            // A closed receiver only means nobody is watching any more.
            let _ = tx.send(chunk.to_vec());
        }
    }
}

// ─── Runners ─────────────────────────────────────────────────────────

/// Executes a program with arguments somewhere.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. `Err` only when the command could not be started
    /// (or was cut short); a non-zero exit is reported in the output.
    async fn run(&self, program: &str, args: &[String], live: LiveOutput) -> VboxResult<RawOutput>;

    /// Human label for log lines (`local` or `user@host:port`).
    fn describe(&self) -> String;

    fn is_remote(&self) -> bool {
        false
    }
}

/// Runs `VBoxManage` as a local child process.
pub struct LocalRunner {
    timeout: Option<Duration>,
}

impl LocalRunner {
    pub fn new(config: &VboxConfig) -> Self {
        let timeout = match config.command_timeout_seconds {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self { timeout }
    }
}

async fn pump<R: AsyncRead + Unpin>(
    mut reader: R,
    live: &LiveOutput,
    stream: OutputStream,
) -> std::io::Result<Vec<u8>> {
    let mut collected = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        live.emit(stream, &buf[..n]);
        collected.extend_from_slice(&buf[..n]);
    }
    Ok(collected)
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn run(&self, program: &str, args: &[String], live: LiveOutput) -> VboxResult<RawOutput> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VboxError::transport_start(program, e))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| VboxError::transport_start(program, "stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| VboxError::transport_start(program, "stderr not captured"))?;

        let work = async {
            tokio::try_join!(
                pump(stdout, &live, OutputStream::Stdout),
                pump(stderr, &live, OutputStream::Stderr),
                child.wait(),
            )
        };

        let joined = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .map_err(|_| VboxError::timeout(program))?,
            None => work.await,
        };
        let (stdout, stderr, status) = joined.map_err(|e| {
            VboxError::session(format!("Reading output of '{}' failed: {}", program, e))
        })?;

        Ok(RawOutput {
            stdout,
            stderr,
            exit_code: status.code(),
        })
    }

    fn describe(&self) -> String {
        "local".to_string()
    }
}

/// Runs `VBoxManage` through an established SSH session.
///
/// Remote commands cannot be cancelled once started; a caller that stops
/// waiting simply leaves the channel to finish on the blocking pool.
pub struct SshRunner {
    session: Arc<SshSession>,
}

impl SshRunner {
    pub fn new(session: Arc<SshSession>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<SshSession> {
        &self.session
    }
}

/// Quote `program` and `args` into one POSIX shell command line.
pub fn shell_command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .map(|a| shell_escape::unix::escape(Cow::Borrowed(a)).into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn run(&self, program: &str, args: &[String], live: LiveOutput) -> VboxResult<RawOutput> {
        let line = shell_command_line(program, args);
        let session = Arc::clone(&self.session);
        let target = self.describe();

        let result = tokio::task::spawn_blocking(move || {
            session.exec(&line, &mut |stream: OutputStream, chunk: &[u8]| {
                live.emit(stream, chunk)
            })
        })
        .await
        .map_err(|e| VboxError::session(format!("Remote command task failed: {}", e)))?;

        match result {
            Ok(out) => Ok(RawOutput {
                stdout: out.stdout,
                stderr: out.stderr,
                exit_code: Some(out.exit_status),
            }),
            Err(SshError::NotConnected) => Err(VboxError::not_connected(&target)),
            Err(e) => Err(VboxError::transport_start(program, e)),
        }
    }

    fn describe(&self) -> String {
        self.session.params().display_target()
    }

    fn is_remote(&self) -> bool {
        true
    }
}

// ─── Target ──────────────────────────────────────────────────────────

/// Where commands run. A server without a host is local.
#[derive(Clone)]
pub enum Target {
    Local,
    Remote(Arc<SshSession>),
}

impl Target {
    pub fn runner(&self, config: &VboxConfig) -> Arc<dyn CommandRunner> {
        match self {
            Target::Local => Arc::new(LocalRunner::new(config)),
            Target::Remote(session) => Arc::new(SshRunner::new(Arc::clone(session))),
        }
    }
}

// ─── Arguments ───────────────────────────────────────────────────────

/// Builder for a `VBoxManage` argument vector.
///
/// Sub-command families disagree on flag syntax: most take
/// `--flag value`, `clonevm`/`createmedium` take `--flag=value`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Args(Vec<String>);

impl Args {
    pub fn new(subcommand: &str) -> Self {
        Self(vec![subcommand.to_string()])
    }

    pub fn arg(mut self, value: impl ToString) -> Self {
        self.0.push(value.to_string());
        self
    }

    /// `--flag value`
    pub fn flag(mut self, name: &str, value: impl ToString) -> Self {
        self.0.push(name.to_string());
        self.0.push(value.to_string());
        self
    }

    /// `--flag=value`
    pub fn flag_eq(mut self, name: &str, value: impl ToString) -> Self {
        self.0.push(format!("{}={}", name, value.to_string()));
        self
    }

    /// Presence-only flag, emitted when `on` is set.
    pub fn switch(mut self, name: &str, on: bool) -> Self {
        if on {
            self.0.push(name.to_string());
        }
        self
    }

    pub fn as_slice(&self) -> &[String] {
        &self.0
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

impl From<Vec<String>> for Args {
    fn from(v: Vec<String>) -> Self {
        Self(v)
    }
}

// ─── Transport ───────────────────────────────────────────────────────

/// `VBoxManage` bound to a runner.
pub struct Transport {
    runner: Arc<dyn CommandRunner>,
    program: String,
}

impl Transport {
    pub fn new(runner: Arc<dyn CommandRunner>, program: impl Into<String>) -> Self {
        Self {
            runner,
            program: program.into(),
        }
    }

    pub fn for_target(target: &Target, config: &VboxConfig) -> Self {
        Self::new(target.runner(config), config.vboxmanage_path.clone())
    }

    pub fn describe(&self) -> String {
        self.runner.describe()
    }

    pub fn is_remote(&self) -> bool {
        self.runner.is_remote()
    }

    fn render(&self, args: &[String]) -> String {
        let mut line = self.program.clone();
        for a in args {
            line.push(' ');
            line.push_str(a);
        }
        line
    }

    /// Run and return the output regardless of exit status.
    pub async fn run(&self, args: &[String]) -> VboxResult<CommandOutput> {
        self.run_live(args, LiveOutput::none()).await
    }

    /// Like [`run`](Self::run), streaming output chunks into `live`.
    pub async fn run_live(&self, args: &[String], live: LiveOutput) -> VboxResult<CommandOutput> {
        let command = self.render(args);
        debug!("VBoxManage [{}]: {}", self.runner.describe(), command);

        let raw = self.runner.run(&self.program, args, live).await?;
        let output = CommandOutput::from_raw(command, raw);

        trace!(
            "VBoxManage stdout ({} bytes), stderr ({} bytes), exit {:?}",
            output.stdout.len(),
            output.stderr.len(),
            output.exit_code
        );
        if !output.success() && !output.stderr.is_empty() {
            warn!("VBoxManage stderr: {}", clip(&output.stderr, 500));
        }
        Ok(output)
    }

    /// Run and require exit zero.
    pub async fn run_ok(&self, args: &[String]) -> VboxResult<CommandOutput> {
        let output = self.run(args).await?;
        output.check_ok()?;
        Ok(output)
    }

    /// Run and require exit zero plus `marker` in the output.
    pub async fn run_expect(&self, args: &[String], marker: &Regex) -> VboxResult<CommandOutput> {
        let output = self.run(args).await?;
        output.check_marker(marker)?;
        Ok(output)
    }

    /// Run a command whose success is signalled by printing nothing.
    pub async fn run_quiet(&self, args: &[String]) -> VboxResult<()> {
        self.run(args).await?.check_silent()
    }
}

/// At most `max_chars` characters of `text`, cut on a char boundary.
fn clip(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VboxErrorKind;
    use crate::testing::ScriptedRunner;
    use std::sync::Once;

    /// Formats every record so logged arguments are actually evaluated.
    struct FormattingLogger;

    impl log::Log for FormattingLogger {
        fn enabled(&self, _: &log::Metadata<'_>) -> bool {
            true
        }

        fn log(&self, record: &log::Record<'_>) {
            let _ = record.args().to_string();
        }

        fn flush(&self) {}
    }

    static LOGGER: FormattingLogger = FormattingLogger;
    static INIT_LOGGER: Once = Once::new();

    fn with_warn_logging() {
        INIT_LOGGER.call_once(|| {
            let _ = log::set_logger(&LOGGER);
            log::set_max_level(log::LevelFilter::Warn);
        });
    }

    #[test]
    fn clip_counts_characters() {
        assert_eq!(clip("abc", 5), "abc");
        assert_eq!(clip("abcdef", 3), "abc");
        assert_eq!(clip("ééé", 2), "éé");
    }

    #[tokio::test]
    async fn failing_command_with_multibyte_stderr_is_logged() {
        with_warn_logging();
        let runner = ScriptedRunner::new();
        let stderr = format!("{}é and more", "x".repeat(499));
        runner.respond_stderr("controlvm", 1, &stderr);
        let transport = Transport::new(runner.clone(), "VBoxManage");
        let out = transport
            .run(&["controlvm".into(), "u".into(), "poweroff".into()])
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(1));
        assert!(!out.success());
        assert_eq!(out.stderr, stderr);
    }

    #[test]
    fn empty_output_is_one_empty_line() {
        let out = CommandOutput::from_raw("x".into(), RawOutput { exit_code: Some(0), ..Default::default() });
        assert_eq!(out.lines, vec![String::new()]);
        assert!(out.is_silent());
    }

    #[test]
    fn stderr_follows_stdout_on_its_own_line() {
        let raw = RawOutput {
            stdout: b"a\r\nb".to_vec(),
            stderr: b"oops\n".to_vec(),
            exit_code: Some(1),
        };
        let out = CommandOutput::from_raw("x".into(), raw);
        assert_eq!(out.lines, vec!["a", "b", "oops", ""]);
        let err = out.check_ok().unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::CommandFailed);
        assert_eq!(err.exit_code, Some(1));
        assert_eq!(err.last_diagnostic(), Some("oops"));
    }

    #[test]
    fn marker_missing_on_clean_exit() {
        let raw = RawOutput {
            stdout: b"Waiting for VM...\n".to_vec(),
            exit_code: Some(0),
            ..Default::default()
        };
        let out = CommandOutput::from_raw("startvm".into(), raw);
        let marker = Regex::new("successfully started").unwrap();
        assert_eq!(out.check_marker(&marker).unwrap_err().kind, VboxErrorKind::MarkerMissing);
    }

    #[test]
    fn shell_line_quotes_arguments() {
        let line = shell_command_line(
            "VBoxManage",
            &["modifyvm".into(), "my vm".into(), "--description".into(), "it's".into()],
        );
        assert_eq!(line, "VBoxManage modifyvm 'my vm' --description 'it'\\''s'");
    }

    #[test]
    fn args_builder_flag_styles() {
        let args = Args::new("clonevm")
            .arg("u1")
            .flag_eq("--name", "copy")
            .switch("--register", true)
            .switch("--dry", false)
            .flag("--mode", "machine");
        assert_eq!(
            args.into_vec(),
            vec!["clonevm", "u1", "--name=copy", "--register", "--mode", "machine"]
        );
    }

    #[tokio::test]
    async fn run_quiet_rejects_chatter() {
        let runner = ScriptedRunner::new();
        runner.respond("controlvm", 0, "something odd\n");
        let transport = Transport::new(runner.clone(), "VBoxManage");
        let err = transport
            .run_quiet(&["controlvm".into(), "u".into(), "pause".into()])
            .await
            .unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::UnexpectedOutput);
        assert_eq!(runner.issued().len(), 1);
    }

    #[tokio::test]
    async fn local_runner_reports_spawn_failure() {
        let runner = LocalRunner::new(&VboxConfig::default());
        let err = runner
            .run("/nonexistent/VBoxManage-missing", &[], LiveOutput::none())
            .await
            .unwrap_err();
        assert_eq!(err.kind, VboxErrorKind::TransportStart);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn local_runner_streams_and_captures() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let runner = LocalRunner::new(&VboxConfig::default());
        let raw = runner
            .run(
                "sh",
                &["-c".into(), "printf out; printf err >&2; exit 3".into()],
                LiveOutput::both(tx),
            )
            .await
            .unwrap();
        assert_eq!(raw.stdout, b"out");
        assert_eq!(raw.stderr, b"err");
        assert_eq!(raw.exit_code, Some(3));
        let mut seen = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            seen.extend(chunk);
        }
        assert_eq!(seen.len(), 6);
    }
}
