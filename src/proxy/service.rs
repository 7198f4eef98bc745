//! Proxy instance lifecycle: start (foreground/background), stop, status
//! (§4.2 "proxy" state machine, §4.3)
//!
//! Grounded on the Python `ProxyService`: fork-to-background with stdio
//! redirection and `setsid()`, a keep-alive poll loop that exits as soon as
//! either the PID file disappears or the tunnel itself reports dead, and a
//! graceful-then-forced stop (SIGTERM, wait 1s, SIGKILL if still alive).

use super::{ForwardTarget, ReverseTunnel};
use crate::config::{ConnectionParams, ProxyConfig, ProxyMode, ProxyState, TunnelConfig};
use crate::error::{RemoteError, Result};
use crate::ssh::SshClient;
use crate::state::FileStateStore;
use std::fs::OpenOptions;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::{dup2, fork, setsid, ForkResult, Pid};

const KEEPALIVE_POLL: Duration = Duration::from_secs(1);
const BUILTIN_ACCEPT_POLL: Duration = Duration::from_millis(200);
const STOP_GRACE_PERIOD: Duration = Duration::from_secs(1);

/// One named reverse-tunnel instance, keyed in a [`FileStateStore`].
pub struct ProxyService {
    name: String,
    store: FileStateStore,
}

impl ProxyService {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_store(name, FileStateStore::default_store())
    }

    pub fn with_store(name: impl Into<String>, store: FileStateStore) -> Self {
        Self { name: name.into(), store }
    }

    pub fn is_running(&self) -> bool {
        self.store.exists(&self.name)
    }

    /// Loads persisted state for this instance, or `None` if it is not
    /// running (a dead entry is self-healed away by `exists`/`load`, not
    /// reported here).
    pub fn status(&self) -> Option<ProxyState> {
        if !self.is_running() {
            return None;
        }
        load_state(&self.store, &self.name)
    }

    /// Names of every currently-live proxy instance.
    pub fn list(store: &FileStateStore) -> Vec<String> {
        store.list()
    }

    /// Status of every currently-live proxy instance.
    pub fn all_status(store: &FileStateStore) -> Vec<ProxyState> {
        Self::list(store).into_iter().filter_map(|name| load_state(store, &name)).collect()
    }

    /// Starts the tunnel. `background=true` forks: the parent records the
    /// child's PID and returns immediately; the child redirects its stdio,
    /// detaches via `setsid`, and runs the tunnel until told to stop. In the
    /// foreground case this call itself blocks for the tunnel's lifetime.
    pub fn start(
        &self,
        config: ProxyConfig,
        conn_params: ConnectionParams,
        ssh_host: &str,
        background: bool,
    ) -> Result<i32> {
        config.validate()?;

        if self.is_running() {
            return Err(RemoteError::ProxyError(format!(
                "proxy '{}' is already running. Stop it first with 'remote proxy stop {}'",
                self.name, self.name
            )));
        }

        if background {
            self.start_background(config, conn_params, ssh_host)
        } else {
            self.start_foreground(config, conn_params, ssh_host)
        }
    }

    #[cfg(unix)]
    fn start_background(&self, config: ProxyConfig, conn_params: ConnectionParams, ssh_host: &str) -> Result<i32> {
        match unsafe { fork() } {
            Ok(ForkResult::Parent { child }) => {
                let pid = child.as_raw();
                self.store.save_pid(&self.name, pid)?;
                self.save_state(&config, ssh_host, pid)?;
                info!(name = %self.name, pid, "proxy started in background");
                Ok(pid)
            }
            Ok(ForkResult::Child) => {
                let pid = std::process::id() as i32;
                if let Err(e) = self.redirect_stdio() {
                    eprintln!("failed to redirect proxy stdio: {}", e);
                }
                setsid().ok();
                let _ = self.store.save_pid(&self.name, pid);

                self.run_proxy(config, conn_params, ssh_host);
                std::process::exit(0);
            }
            Err(e) => Err(RemoteError::ProxyError(format!("fork failed: {}", e))),
        }
    }

    #[cfg(not(unix))]
    fn start_background(&self, _config: ProxyConfig, _conn_params: ConnectionParams, _ssh_host: &str) -> Result<i32> {
        Err(RemoteError::ProxyError("background proxies require a unix host".into()))
    }

    fn start_foreground(&self, config: ProxyConfig, conn_params: ConnectionParams, ssh_host: &str) -> Result<i32> {
        let pid = std::process::id() as i32;
        self.store.save_pid(&self.name, pid)?;
        self.save_state(&config, ssh_host, pid)?;
        info!(name = %self.name, pid, "proxy started in foreground");

        self.run_proxy(config, conn_params, ssh_host);
        let _ = self.stop();
        Ok(pid)
    }

    fn save_state(&self, config: &ProxyConfig, ssh_host: &str, pid: i32) -> Result<()> {
        let started_at = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        let state = ProxyState {
            name: self.name.clone(),
            config: config.clone(),
            ssh_host: ssh_host.to_string(),
            pid,
            started_at,
            tunnel: TunnelConfig {
                remote_port: config.remote_port,
                local_host: config.local_host.clone(),
                local_port: config.local_port,
            },
        };

        let blob = serde_json::to_value(&state)?;
        self.store.save(&self.name, &blob)
    }

    #[cfg(unix)]
    fn redirect_stdio(&self) -> Result<()> {
        use std::os::unix::io::AsRawFd;

        let out_path = self.store.log_file(&self.name, "out");
        let err_path = self.store.log_file(&self.name, "err");
        let out = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&out_path)
            .map_err(|e| RemoteError::io(&out_path, e))?;
        let err = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&err_path)
            .map_err(|e| RemoteError::io(&err_path, e))?;

        dup2(out.as_raw_fd(), libc::STDOUT_FILENO)
            .map_err(|e| RemoteError::ProxyError(format!("dup2 stdout failed: {}", e)))?;
        dup2(err.as_raw_fd(), libc::STDERR_FILENO)
            .map_err(|e| RemoteError::ProxyError(format!("dup2 stderr failed: {}", e)))?;
        Ok(())
    }

    /// Connects, starts the reverse tunnel (and the built-in listener, if
    /// configured), then blocks in the keep-alive poll loop until the state
    /// entry disappears or the tunnel reports dead. Errors are logged, not
    /// returned, since this runs at the tail of a detached process.
    fn run_proxy(&self, config: ProxyConfig, conn_params: ConnectionParams, ssh_host: &str) {
        let client = match SshClient::connect(&conn_params) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                error!(name = %self.name, error = %e, "proxy failed to connect");
                let _ = self.store.delete(&self.name);
                return;
            }
        };

        let tunnel_config = TunnelConfig {
            remote_port: config.remote_port,
            local_host: config.local_host.clone(),
            local_port: config.local_port,
        };

        let target = if config.use_builtin {
            ForwardTarget::BuiltinProxy { mode: config.mode }
        } else {
            ForwardTarget::LocalSocket {
                host: config.local_host.clone(),
                port: config.local_port,
            }
        };

        let mut tunnel = match ReverseTunnel::start(client.clone(), tunnel_config, target) {
            Ok(tunnel) => tunnel,
            Err(e) => {
                error!(name = %self.name, error = %e, "reverse tunnel failed to start");
                let _ = self.store.delete(&self.name);
                return;
            }
        };

        info!(name = %self.name, host = %ssh_host, "proxy tunnel started");

        let listener_running = Arc::new(AtomicBool::new(true));
        let listener_handle = if config.use_builtin {
            match spawn_builtin_listener(
                client.clone(),
                config.local_host.clone(),
                config.local_port,
                config.mode,
                listener_running.clone(),
            ) {
                Ok(handle) => Some(handle),
                Err(e) => {
                    warn!(name = %self.name, error = %e, "built-in proxy listener failed to start");
                    None
                }
            }
        } else {
            None
        };

        loop {
            if !self.store.exists(&self.name) {
                break;
            }
            if !tunnel.is_running() {
                warn!(name = %self.name, "tunnel connection lost");
                break;
            }
            std::thread::sleep(KEEPALIVE_POLL);
        }

        listener_running.store(false, Ordering::SeqCst);
        if let Some(handle) = listener_handle {
            let _ = handle.join();
        }
        tunnel.stop();
        let _ = self.store.delete(&self.name);
    }

    /// Stops a running instance: SIGTERM, wait 1s, SIGKILL if still alive.
    #[cfg(unix)]
    pub fn stop(&self) -> Result<()> {
        if !self.is_running() {
            return Err(RemoteError::ProxyError(format!("proxy '{}' is not running", self.name)));
        }

        let pid = match self.store.load_pid(&self.name) {
            Some(pid) => pid,
            None => {
                let _ = self.store.delete(&self.name);
                return Err(RemoteError::ProxyError(format!("proxy '{}' pid not found", self.name)));
            }
        };

        let nix_pid = Pid::from_raw(pid);
        kill(nix_pid, Signal::SIGTERM).ok();
        std::thread::sleep(STOP_GRACE_PERIOD);
        if kill(nix_pid, None).is_ok() {
            kill(nix_pid, Signal::SIGKILL).ok();
        }

        self.store.delete(&self.name)?;
        info!(name = %self.name, pid, "proxy stopped");
        Ok(())
    }

    #[cfg(not(unix))]
    pub fn stop(&self) -> Result<()> {
        self.store.delete(&self.name)
    }
}

fn load_state(store: &FileStateStore, name: &str) -> Option<ProxyState> {
    let blob = store.load(name)?;
    serde_json::from_value(blob).ok()
}

/// Built-in proxy server's local TCP listener (§4.3 "Built-in proxy mode").
/// Each accepted connection runs the SOCKS5/HTTP-CONNECT handshake, dials
/// the resolved target through a fresh `direct-tcpip` channel, and splices.
fn spawn_builtin_listener(
    client: Arc<SshClient>,
    host: String,
    port: u16,
    mode: ProxyMode,
    running: Arc<AtomicBool>,
) -> Result<std::thread::JoinHandle<()>> {
    let addr = format!("{}:{}", host, port);
    let listener = TcpListener::bind(&addr)
        .map_err(|e| RemoteError::ProxyError(format!("built-in proxy listener on {} failed: {}", addr, e)))?;
    listener
        .set_nonblocking(true)
        .map_err(|e| RemoteError::ProxyError(format!("built-in proxy listener setup failed: {}", e)))?;

    Ok(std::thread::spawn(move || {
        while running.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _)) => {
                    let client = client.clone();
                    let running = running.clone();
                    std::thread::spawn(move || {
                        if let Err(e) = super::proxy_one_connection(stream, &client, mode, &running) {
                            debug!(error = %e, "built-in proxy connection ended");
                        }
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(BUILTIN_ACCEPT_POLL);
                }
                Err(e) => {
                    warn!(error = %e, "built-in proxy listener error");
                    break;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config() -> ProxyConfig {
        ProxyConfig {
            local_port: 7890,
            remote_port: 1081,
            mode: ProxyMode::Socks5,
            local_host: "localhost".into(),
            use_builtin: true,
        }
    }

    #[test]
    fn stop_on_unknown_instance_is_an_error() {
        let dir = tempdir().unwrap();
        let svc = ProxyService::with_store("ghost", FileStateStore::new(dir.path()));
        assert!(svc.stop().is_err());
    }

    #[test]
    fn status_is_none_when_not_running() {
        let dir = tempdir().unwrap();
        let svc = ProxyService::with_store("p1", FileStateStore::new(dir.path()));
        assert!(svc.status().is_none());
    }

    #[test]
    fn start_rejects_invalid_config() {
        let dir = tempdir().unwrap();
        let svc = ProxyService::with_store("p1", FileStateStore::new(dir.path()));
        let mut bad = config();
        bad.local_port = 0;
        let conn = ConnectionParams::new("example.com", "user");
        assert!(svc.start(bad, conn, "example.com", false).is_err());
    }

    #[test]
    fn list_is_empty_for_fresh_store() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(ProxyService::list(&store).is_empty());
    }
}
