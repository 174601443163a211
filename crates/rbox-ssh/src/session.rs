//! A single SSH connection used as a command transport.
//!
//! The session authenticates in blocking mode and is then switched to
//! non-blocking mode, so several channels (one per command) can make
//! progress on the same connection. Every libssh2 call that can report
//! "would block" goes through [`retry`].

use std::io::{ErrorKind, Read};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use log::{debug, info, warn};
use secrecy::ExposeSecret;
use ssh2::{HashType, KeyboardInteractivePrompt, Prompt, Session};

use crate::error::{SshError, SshResult};
use crate::types::{ExecOutput, OutputStream, SshParams, TransferStats};

const POLL_INTERVAL: Duration = Duration::from_millis(5);
const LIBSSH2_ERROR_EAGAIN: i32 = -37;

pub struct SshSession {
    params: Arc<SshParams>,
    session: Mutex<Option<Session>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    commands_run: AtomicU64,
}

impl SshSession {
    /// Open and authenticate a new session.
    pub fn connect(params: Arc<SshParams>) -> SshResult<Self> {
        let session = open_session(&params)?;
        Ok(Self {
            params,
            session: Mutex::new(Some(session)),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            commands_run: AtomicU64::new(0),
        })
    }

    pub fn params(&self) -> &SshParams {
        &self.params
    }

    pub fn is_connected(&self) -> bool {
        self.guard().is_some()
    }

    /// Drop the current connection (if any) and establish a new one with
    /// the stored parameters. Counters are kept.
    pub fn reconnect(&self) -> SshResult<()> {
        let old = self.guard().take();
        if let Some(old) = old {
            close_session(&old);
        }
        let fresh = open_session(&self.params)?;
        *self.guard() = Some(fresh);
        Ok(())
    }

    pub fn disconnect(&self) -> SshResult<()> {
        match self.guard().take() {
            Some(session) => {
                close_session(&session);
                info!("SSH session to {} closed", self.params.display_target());
                Ok(())
            }
            None => Err(SshError::NotConnected),
        }
    }

    pub fn stats(&self) -> TransferStats {
        TransferStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            commands_run: self.commands_run.load(Ordering::Relaxed),
        }
    }

    /// Run `command` in a fresh channel and collect stdout and stderr
    /// separately. Every chunk is also handed to `live` as it arrives.
    ///
    /// Blocks the calling thread until the remote command exits.
    pub fn exec(
        &self,
        command: &str,
        live: &mut dyn FnMut(OutputStream, &[u8]),
    ) -> SshResult<ExecOutput> {
        let session = self.guard().clone().ok_or(SshError::NotConnected)?;
        debug!("ssh {}: {}", self.params.display_target(), command);

        let mut channel = retry(|| session.channel_session())?;
        retry(|| channel.exec(command))?;
        self.bytes_sent.fetch_add(command.len() as u64, Ordering::Relaxed);
        self.commands_run.fetch_add(1, Ordering::Relaxed);

        let mut out = ExecOutput::default();
        let mut buf = [0u8; 8192];
        loop {
            let mut progressed = false;

            let stdout_drained = drain(&mut channel, &mut buf, &mut |chunk| {
                live(OutputStream::Stdout, chunk);
                out.stdout.extend_from_slice(chunk);
                progressed = true;
            })?;
            let stderr_drained = drain(&mut channel.stderr(), &mut buf, &mut |chunk| {
                live(OutputStream::Stderr, chunk);
                out.stderr.extend_from_slice(chunk);
                progressed = true;
            })?;

            if stdout_drained && stderr_drained && channel.eof() {
                break;
            }
            if !progressed {
                thread::sleep(POLL_INTERVAL);
            }
        }

        retry(|| channel.wait_close())?;
        out.exit_status = channel.exit_status()?;
        self.bytes_received.fetch_add(
            (out.stdout.len() + out.stderr.len()) as u64,
            Ordering::Relaxed,
        );
        Ok(out)
    }

    fn guard(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        if let Some(session) = self.guard().take() {
            close_session(&session);
        }
    }
}

// ─── Connection setup ────────────────────────────────────────────────

fn open_session(params: &SshParams) -> SshResult<Session> {
    let stream = connect_tcp(params)?;
    stream.set_nodelay(true).ok();

    let mut session = Session::new().map_err(|e| SshError::Handshake {
        host: params.host.clone(),
        source: e,
    })?;
    session.set_tcp_stream(stream);
    session.set_timeout(params.connect_timeout.as_millis() as u32);
    session.handshake().map_err(|e| SshError::Handshake {
        host: params.host.clone(),
        source: e,
    })?;

    // Host keys are accepted without verification: the managed hosts are
    // private, pre-known machines. The fingerprint is logged for audits.
    if let Some(hash) = session.host_key_hash(HashType::Sha256) {
        debug!("{} host key SHA256:{}", params.host, hex::encode(hash));
    }

    authenticate(&session, params)?;

    session.set_timeout(0);
    session.set_blocking(false);
    info!("SSH session to {} established", params.display_target());
    Ok(session)
}

fn connect_tcp(params: &SshParams) -> SshResult<TcpStream> {
    let connect_err = |source: std::io::Error| SshError::Connect {
        host: params.host.clone(),
        port: params.port,
        source,
    };
    let addrs = (params.host.as_str(), params.port)
        .to_socket_addrs()
        .map_err(connect_err)?;

    let mut last_err = std::io::Error::new(ErrorKind::NotFound, "host resolved to no addresses");
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, params.connect_timeout) {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = e,
        }
    }
    Err(connect_err(last_err))
}

/// Key file first (its passphrase is the stored secret); otherwise password
/// and keyboard-interactive, whichever the server offers, both answered
/// with the stored secret.
fn authenticate(session: &Session, params: &SshParams) -> SshResult<()> {
    let user = params.username.as_str();
    let secret = params.secret.as_ref().map(|s| s.expose_secret().as_str());
    let auth_err = |reason: String| SshError::Auth {
        user: user.to_string(),
        host: params.host.clone(),
        reason,
    };

    if let Some(ref key_file) = params.key_file {
        let path = expand_home(key_file);
        if !path.exists() {
            return Err(SshError::KeyFileMissing(path.display().to_string()));
        }
        return session
            .userauth_pubkey_file(user, None, &path, secret)
            .map_err(|e| auth_err(format!("public key rejected: {}", e)));
    }

    let secret = secret.ok_or_else(|| auth_err("no password or key file configured".into()))?;
    let methods = session
        .auth_methods(user)
        .map(|m| m.to_string())
        .unwrap_or_default();
    debug!("{} offers auth methods: {}", params.host, methods);

    if methods.is_empty() || methods.contains("password") {
        match session.userauth_password(user, secret) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("password auth for {} failed: {}", user, e),
        }
    }

    if methods.is_empty() || methods.contains("keyboard-interactive") {
        let mut responder = SecretResponder { secret };
        match session.userauth_keyboard_interactive(user, &mut responder) {
            Ok(()) => return Ok(()),
            Err(e) => debug!("keyboard-interactive auth for {} failed: {}", user, e),
        }
    }

    if session.authenticated() {
        return Ok(());
    }
    Err(auth_err("password and keyboard-interactive rejected".into()))
}

/// Answers every challenge with the same secret.
struct SecretResponder<'s> {
    secret: &'s str,
}

impl KeyboardInteractivePrompt for SecretResponder<'_> {
    fn prompt<'a>(
        &mut self,
        _username: &str,
        _instructions: &str,
        prompts: &[Prompt<'a>],
    ) -> Vec<String> {
        prompts.iter().map(|_| self.secret.to_string()).collect()
    }
}

fn close_session(session: &Session) {
    if let Err(e) = retry(|| session.disconnect(None, "closing", None)) {
        warn!("SSH disconnect reported an error: {}", e);
    }
}

// ─── Non-blocking helpers ────────────────────────────────────────────

fn is_would_block(err: &ssh2::Error) -> bool {
    matches!(err.code(), ssh2::ErrorCode::Session(LIBSSH2_ERROR_EAGAIN))
}

fn retry<T>(mut op: impl FnMut() -> Result<T, ssh2::Error>) -> Result<T, ssh2::Error> {
    loop {
        match op() {
            Err(e) if is_would_block(&e) => thread::sleep(POLL_INTERVAL),
            other => return other,
        }
    }
}

/// Read everything currently available. Returns `true` once the stream has
/// reported end-of-file.
fn drain(
    reader: &mut dyn Read,
    buf: &mut [u8],
    sink: &mut dyn FnMut(&[u8]),
) -> SshResult<bool> {
    loop {
        match reader.read(buf) {
            Ok(0) => return Ok(true),
            Ok(n) => sink(&buf[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(SshError::Io(e)),
        }
    }
}

fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| path.to_path_buf()),
        Err(_) => path.to_path_buf(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;
    use std::io::Cursor;
    use std::net::TcpListener;

    #[test]
    fn responder_answers_every_prompt_with_secret() {
        let mut responder = SecretResponder { secret: "hunter2" };
        let prompts = vec![
            Prompt { text: Cow::Borrowed("Password: "), echo: false },
            Prompt { text: Cow::Borrowed("Verification code: "), echo: false },
        ];
        let answers = responder.prompt("root", "", &prompts);
        assert_eq!(answers, vec!["hunter2".to_string(), "hunter2".to_string()]);
    }

    #[test]
    fn expand_home_rewrites_tilde_prefix() {
        let expanded = expand_home(Path::new("~/.ssh/id_ed25519"));
        if let Some(home) = dirs::home_dir() {
            assert_eq!(expanded, home.join(".ssh/id_ed25519"));
        }
        let absolute = expand_home(Path::new("/etc/ssh/key"));
        assert_eq!(absolute, PathBuf::from("/etc/ssh/key"));
    }

    #[test]
    fn drain_reports_eof_after_reading_everything() {
        let mut reader = Cursor::new(b"0%...50%...100%\n".to_vec());
        let mut buf = [0u8; 4];
        let mut collected = Vec::new();
        let eof = drain(&mut reader, &mut buf, &mut |chunk| collected.extend_from_slice(chunk))
            .unwrap();
        assert!(eof);
        assert_eq!(collected, b"0%...50%...100%\n");
    }

    #[test]
    fn connect_to_closed_port_is_a_connect_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let params = SshParams::new("127.0.0.1", "nobody").with_port(port);
        match SshSession::connect(Arc::new(params)) {
            Err(SshError::Connect { port: p, .. }) => assert_eq!(p, port),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("connected to a closed port"),
        }
    }

    #[test]
    fn display_target_formats_user_host_port() {
        let params = SshParams::new("vbox01.lan", "admin").with_port(2222);
        assert_eq!(params.display_target(), "admin@vbox01.lan:2222");
    }
}
