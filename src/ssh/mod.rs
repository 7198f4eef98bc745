//! SSH client wrapper
//!
//! Wraps an `ssh2::Session` with the primitives every subsystem needs: command
//! execution (batch and streaming), a cached SFTP handle, and the reverse/
//! direct channel operations the proxy and transfer engines build on.

use crate::config::ConnectionParams;
use crate::error::{RemoteError, Result};
use ssh2::{Channel, Listener, Session, Sftp};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::{Duration, Instant};

/// Result of a non-streaming `exec`.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
}

/// An SSH session plus a lazily (re)opened SFTP channel.
pub struct SshClient {
    session: Session,
    sftp: Option<Sftp>,
    params: ConnectionParams,
    /// Set when key auth failed and password auth was used instead (§4.1).
    used_key_fallback: bool,
}

impl SshClient {
    /// Connects and authenticates. Tries key auth first if a key path is
    /// configured (auto-detecting Ed25519 before RSA is `ssh2`'s own
    /// behavior when a passphrase-less key is handed over); on failure, if a
    /// password is present, falls back to password auth and records that
    /// fact via `used_key_fallback`.
    pub fn connect(params: &ConnectionParams) -> Result<Self> {
        let addr = format!("{}:{}", params.host, params.port);
        let tcp = TcpStream::connect(&addr)
            .map_err(|e| RemoteError::connection(&params.host, e.to_string()))?;
        tcp.set_read_timeout(Some(Duration::from_secs(params.timeout))).ok();

        let mut session =
            Session::new().map_err(|e| RemoteError::connection(&params.host, e.to_string()))?;
        session.set_tcp_stream(tcp);
        session
            .handshake()
            .map_err(|e| RemoteError::connection(&params.host, e.to_string()))?;

        let used_key_fallback = Self::authenticate(&mut session, params)?;

        Ok(Self {
            session,
            sftp: None,
            params: params.clone(),
            used_key_fallback,
        })
    }

    /// Returns `true` if key auth was attempted and failed, and password
    /// auth was used in its place.
    fn authenticate(session: &mut Session, params: &ConnectionParams) -> Result<bool> {
        let mut fell_back = false;

        if let Some(key_path) = &params.key_path {
            if session
                .userauth_pubkey_file(&params.user, None, key_path, None)
                .is_err()
            {
                if let Some(password) = &params.password {
                    session
                        .userauth_password(&params.user, password)
                        .map_err(|e| RemoteError::auth(&params.user, &params.host, e.to_string()))?;
                    fell_back = true;
                } else {
                    return Err(RemoteError::auth(
                        &params.user,
                        &params.host,
                        "key auth failed and no password available for fallback",
                    ));
                }
            }
        } else if let Some(password) = &params.password {
            session
                .userauth_password(&params.user, password)
                .map_err(|e| RemoteError::auth(&params.user, &params.host, e.to_string()))?;
        } else {
            return Err(RemoteError::auth(
                &params.user,
                &params.host,
                "no key path or password configured",
            ));
        }

        if !session.authenticated() {
            return Err(RemoteError::auth(&params.user, &params.host, "authentication failed"));
        }

        Ok(fell_back)
    }

    pub fn used_key_fallback(&self) -> bool {
        self.used_key_fallback
    }

    pub fn host(&self) -> &str {
        &self.params.host
    }

    /// Runs `cmd` to completion, collecting stdout/stderr in full before
    /// returning.
    pub fn exec(&self, cmd: &str) -> Result<ExecResult> {
        let mut channel = self.open_session_channel()?;
        channel
            .exec(cmd)
            .map_err(|e| RemoteError::connection(self.host(), e.to_string()))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        channel
            .read_to_end(&mut stdout)
            .map_err(|e| RemoteError::connection(self.host(), e.to_string()))?;
        channel
            .stderr()
            .read_to_end(&mut stderr)
            .map_err(|e| RemoteError::connection(self.host(), e.to_string()))?;

        channel.wait_close().ok();
        let exit_code = channel.exit_status().unwrap_or(-1);

        Ok(ExecResult { stdout, stderr, exit_code })
    }

    /// Runs `cmd`, calling `on_out`/`on_err` with every buffer read as it
    /// arrives. Polls readiness with a short idle sleep rather than
    /// busy-spinning; returns the final exit code.
    pub fn exec_streaming(
        &self,
        cmd: &str,
        mut on_out: impl FnMut(&[u8]),
        mut on_err: impl FnMut(&[u8]),
    ) -> Result<i32> {
        let mut channel = self.open_session_channel()?;
        channel
            .exec(cmd)
            .map_err(|e| RemoteError::connection(self.host(), e.to_string()))?;

        let mut buf = [0u8; 8192];
        loop {
            let mut made_progress = false;

            match channel.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    on_out(&buf[..n]);
                    made_progress = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(RemoteError::connection(self.host(), e.to_string())),
            }

            match channel.stderr().read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    on_err(&buf[..n]);
                    made_progress = true;
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(RemoteError::connection(self.host(), e.to_string())),
            }

            if channel.eof() {
                break;
            }

            if !made_progress {
                std::thread::sleep(Duration::from_millis(10));
            }
        }

        channel.wait_close().ok();
        Ok(channel.exit_status().unwrap_or(-1))
    }

    /// Opens a pseudo-interactive shell: writes `cmd` followed by `exit\n`
    /// and drains output under a hard wall-clock deadline (§9b — no real PTY
    /// allocation, since true interactive execution is a non-goal).
    pub fn exec_interactive(
        &self,
        cmd: &str,
        mut on_out: impl FnMut(&[u8]),
        timeout: Duration,
    ) -> Result<i32> {
        let mut channel = self.open_session_channel()?;
        channel
            .shell()
            .map_err(|e| RemoteError::connection(self.host(), e.to_string()))?;
        channel
            .write_all(format!("{}\nexit\n", cmd).as_bytes())
            .map_err(|e| RemoteError::connection(self.host(), e.to_string()))?;

        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; 8192];
        loop {
            if Instant::now() >= deadline {
                return Err(RemoteError::Timeout(timeout.as_secs()));
            }

            match channel.read(&mut buf) {
                Ok(0) => {
                    if channel.eof() {
                        break;
                    }
                    std::thread::sleep(Duration::from_millis(10));
                }
                Ok(n) => on_out(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(10));
                }
                Err(e) => return Err(RemoteError::connection(self.host(), e.to_string())),
            }

            if channel.eof() {
                break;
            }
        }

        channel.wait_close().ok();
        Ok(channel.exit_status().unwrap_or(-1))
    }

    fn open_session_channel(&self) -> Result<Channel> {
        self.session
            .channel_session()
            .map_err(|e| RemoteError::connection(self.host(), e.to_string()))
    }

    /// Returns the cached SFTP handle if its channel is alive, otherwise
    /// opens and caches a new one. Each call that needs true parallelism
    /// should instead use [`Self::open_fresh_sftp`], since one cached handle
    /// is shared mutable state.
    pub fn open_sftp(&mut self) -> Result<&Sftp> {
        if self.sftp.is_none() {
            let sftp = self
                .session
                .sftp()
                .map_err(|e| RemoteError::connection(self.host(), e.to_string()))?;
            self.sftp = Some(sftp);
        }
        Ok(self.sftp.as_ref().unwrap())
    }

    /// Opens a brand-new SFTP handle over the same transport. The transport
    /// multiplexes channels, so parallel transfer workers use one of these
    /// each rather than sharing a single handle or opening a second TCP
    /// connection (§5, §9d).
    pub fn open_fresh_sftp(&self) -> Result<Sftp> {
        self.session
            .sftp()
            .map_err(|e| RemoteError::connection(self.host(), e.to_string()))
    }

    /// Recursively creates `path` on the remote via SFTP, ignoring
    /// "already exists".
    pub fn create_remote_dir_all(&self, sftp: &Sftp, path: &Path) -> Result<()> {
        let mut current = std::path::PathBuf::new();
        for component in path.components() {
            current.push(component);
            match sftp.stat(&current) {
                Ok(stat) => {
                    if !stat.is_dir() {
                        return Err(RemoteError::TransferError(format!(
                            "path exists but is not a directory: {:?}",
                            current
                        )));
                    }
                }
                Err(_) => {
                    sftp.mkdir(&current, 0o755)
                        .map_err(|e| RemoteError::TransferError(e.to_string()))?;
                }
            }
        }
        Ok(())
    }

    /// Asks the server to bind a port and forward accepted connections back
    /// to this client (`forwarded-tcpip`).
    pub fn request_reverse_port_forward(&self, port: u16) -> Result<Listener> {
        self.session
            .channel_forward_listen(port as i32, None, None)
            .map(|(listener, _bound_port)| listener)
            .map_err(|e| RemoteError::ProxyError(format!("reverse forward refused: {}", e)))
    }

    /// Blocks up to `timeout` for an incoming forwarded channel.
    pub fn accept_channel(&self, listener: &mut Listener, timeout: Duration) -> Result<Option<Channel>> {
        self.session.set_blocking(false);
        let deadline = Instant::now() + timeout;
        loop {
            match listener.accept() {
                Ok(channel) => {
                    self.session.set_blocking(true);
                    return Ok(Some(channel));
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if Instant::now() >= deadline {
                        self.session.set_blocking(true);
                        return Ok(None);
                    }
                    std::thread::sleep(Duration::from_millis(50));
                }
                Err(e) => {
                    self.session.set_blocking(true);
                    return Err(RemoteError::connection(self.host(), e.to_string()));
                }
            }
        }
    }

    /// Opens a `direct-tcpip` channel: asks the server to connect outward to
    /// `dest_host:dest_port` and pipe the connection through a channel.
    pub fn open_direct_tcpip(&self, dest_host: &str, dest_port: u16) -> Result<Channel> {
        self.session
            .channel_direct_tcpip(dest_host, dest_port, None)
            .map_err(|e| RemoteError::connection(self.host(), e.to_string()))
    }

    pub fn is_alive(&self) -> bool {
        self.session.authenticated()
    }

    /// Toggles the underlying session's blocking mode. Shared by every
    /// channel on this session (libssh2 has no per-channel flag), so callers
    /// that hold channels across threads (the proxy splicer/acceptor pair)
    /// must tolerate brief windows where a concurrent toggle changes this
    /// out from under them (§5, §9 proxy concurrency note).
    pub fn set_session_blocking(&self, blocking: bool) {
        self.session.set_blocking(blocking);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthMethod;

    fn params() -> ConnectionParams {
        ConnectionParams {
            host: "localhost".into(),
            user: "test".into(),
            port: 22,
            auth_method: AuthMethod::Key,
            password: None,
            key_path: None,
            timeout: 5,
        }
    }

    #[test]
    #[ignore]
    fn connect_requires_live_server() {
        let p = params();
        let client = SshClient::connect(&p);
        assert!(client.is_err() || client.is_ok());
    }
}
