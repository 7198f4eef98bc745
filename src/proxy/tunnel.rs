//! Reverse tunnel acceptor and bidirectional splicer (§4.3, §5)
//!
//! One acceptor thread calls `acceptChannel(timeout=1s)` in a loop; each
//! accepted channel spawns a dedicated splicer thread that copies bytes
//! between the forwarded channel and a fresh local socket until either side
//! closes (§4.3 "Reverse tunnel mode", §5 "Reverse tunnel").

use crate::config::{ProxyMode, TunnelConfig};
use crate::error::{RemoteError, Result};
use crate::ssh::SshClient;
use ssh2::Channel;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SPLICE_BUF_SIZE: usize = 8 * 1024;
const SPLICE_IDLE_SLEEP: Duration = Duration::from_millis(20);
const ACCEPT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPTOR_JOIN_TIMEOUT: Duration = Duration::from_secs(2);
const SPLICER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Owns the acceptor thread and the pool of in-flight splicer threads for
/// one reverse-tunnel instance.
pub struct ReverseTunnel {
    running: Arc<AtomicBool>,
    splicers: Arc<Mutex<Vec<JoinHandle<()>>>>,
    acceptor: Option<JoinHandle<()>>,
}

/// What a connection accepted off the reverse tunnel should be spliced to
/// (§4.3 "Reverse tunnel mode" vs. "Built-in proxy mode").
#[derive(Clone)]
pub enum ForwardTarget {
    /// Classic reverse port-forward: splice straight to a local TCP service.
    LocalSocket { host: String, port: u16 },
    /// Built-in proxy mode: the forwarded channel itself speaks SOCKS5 or
    /// HTTP CONNECT; run that handshake on the channel, then dial the
    /// resolved target via `direct-tcpip` and splice channel-to-channel.
    BuiltinProxy { mode: ProxyMode },
}

impl ReverseTunnel {
    /// Requests the reverse port forward and starts the acceptor thread.
    /// `client` must stay alive and connected for the tunnel's lifetime.
    pub fn start(client: Arc<SshClient>, config: TunnelConfig, target: ForwardTarget) -> Result<Self> {
        let mut listener = client.request_reverse_port_forward(config.remote_port)?;
        let running = Arc::new(AtomicBool::new(true));
        let splicers: Arc<Mutex<Vec<JoinHandle<()>>>> = Arc::new(Mutex::new(Vec::new()));

        let acceptor = {
            let running = running.clone();
            let splicers = splicers.clone();
            let client = client.clone();
            let target = target.clone();

            std::thread::spawn(move || {
                while running.load(Ordering::SeqCst) {
                    match client.accept_channel(&mut listener, ACCEPT_POLL_TIMEOUT) {
                        Ok(Some(channel)) => {
                            let running = running.clone();
                            let client = client.clone();
                            let target = target.clone();
                            let handle = std::thread::spawn(move || {
                                if let Err(e) = handle_forwarded_connection(channel, &client, &target, &running) {
                                    debug!(error = %e, "tunnel connection ended");
                                }
                            });

                            let mut guard = splicers.lock().unwrap();
                            guard.retain(|h| !h.is_finished());
                            guard.push(handle);
                        }
                        Ok(None) => {}
                        Err(e) => {
                            warn!(error = %e, "reverse tunnel transport lost");
                            running.store(false, Ordering::SeqCst);
                        }
                    }
                }
            })
        };

        Ok(Self {
            running,
            splicers,
            acceptor: Some(acceptor),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Signals shutdown, joins the acceptor up to 2s, then each splicer up
    /// to 0.5s (§4.3 lifecycle state machine, `Stopping`).
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.acceptor.take() {
            join_with_timeout(handle, ACCEPTOR_JOIN_TIMEOUT);
        }

        let handles: Vec<_> = self.splicers.lock().unwrap().drain(..).collect();
        for handle in handles {
            join_with_timeout(handle, SPLICER_JOIN_TIMEOUT);
        }
    }
}

impl Drop for ReverseTunnel {
    fn drop(&mut self) {
        if self.running.load(Ordering::SeqCst) {
            self.stop();
        }
    }
}

fn handle_forwarded_connection(
    channel: Channel,
    client: &SshClient,
    target: &ForwardTarget,
    running: &AtomicBool,
) -> Result<()> {
    match target {
        ForwardTarget::LocalSocket { host, port } => {
            let addr = format!("{}:{}", host, port);
            let socket = TcpStream::connect(&addr)
                .map_err(|e| RemoteError::ProxyError(format!("local proxy connect to {} failed: {}", addr, e)))?;
            socket.set_read_timeout(Some(Duration::from_secs(10))).ok();
            client.set_session_blocking(false);
            splice(channel, socket, running)
        }
        ForwardTarget::BuiltinProxy { mode } => super::proxy_one_connection(channel, client, *mode, running),
    }
}

/// Either end of a splice: a readable/writable stream that knows how to
/// tear itself down and prepare itself for non-blocking polling.
/// `TcpStream`/`Channel` differ on both counts (socket shutdown vs. SSH
/// channel close; `set_nonblocking` vs. the session-wide blocking flag that
/// [`SshClient::set_session_blocking`](crate::ssh::SshClient::set_session_blocking)
/// governs), so this is not just `Read + Write`.
pub trait SpliceEnd: Read + Write {
    fn shutdown_end(&mut self);

    /// Puts this end into non-blocking mode. No-op for channels: their
    /// blocking mode is session-wide, so the caller toggles it once via
    /// `set_session_blocking` before splicing rather than per-channel here.
    fn prepare_for_splice(&mut self) {}
}

impl SpliceEnd for TcpStream {
    fn shutdown_end(&mut self) {
        let _ = TcpStream::shutdown(self, std::net::Shutdown::Both);
    }

    fn prepare_for_splice(&mut self) {
        let _ = self.set_nonblocking(true);
    }
}

impl SpliceEnd for Channel {
    fn shutdown_end(&mut self) {
        let _ = self.close();
    }
}

/// Copies bytes bidirectionally between `a` and `b` until either side
/// returns 0/errors, then closes both (§4.3 Splicer). Runs entirely on the
/// calling thread, polling each side non-blockingly with a short idle sleep
/// so one dedicated thread per connection is enough. Any channel end must
/// already have its session's blocking flag cleared by the caller
/// beforehand; socket ends are switched to non-blocking here.
pub fn splice<A: SpliceEnd, B: SpliceEnd>(mut a: A, mut b: B, running: &AtomicBool) -> Result<()> {
    a.prepare_for_splice();
    b.prepare_for_splice();
    let mut buf = [0u8; SPLICE_BUF_SIZE];

    loop {
        if !running.load(Ordering::SeqCst) {
            break;
        }

        let mut made_progress = false;

        match a.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if b.write_all(&buf[..n]).is_err() {
                    break;
                }
                made_progress = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        match b.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if a.write_all(&buf[..n]).is_err() {
                    break;
                }
                made_progress = true;
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
            Err(_) => break,
        }

        if !made_progress {
            std::thread::sleep(SPLICE_IDLE_SLEEP);
        }
    }

    a.shutdown_end();
    b.shutdown_end();
    Ok(())
}

fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) -> bool {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return true;
        }
        if start.elapsed() >= timeout {
            return false;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn splice_relays_both_directions_until_peer_closes() {
        let (mut left_client, left_server) = loopback_pair();
        let (mut right_client, right_server) = loopback_pair();

        let running = Arc::new(AtomicBool::new(true));
        let splicer_running = running.clone();
        let splicer = std::thread::spawn(move || {
            splice(left_server, right_server, &splicer_running).unwrap();
        });

        left_client.write_all(b"to-right").unwrap();
        let mut buf = [0u8; 8];
        right_client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"to-right");

        right_client.write_all(b"to-left!").unwrap();
        let mut buf = [0u8; 8];
        left_client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"to-left!");

        drop(left_client);
        drop(right_client);
        splicer.join().unwrap();
        running.store(false, Ordering::SeqCst);
    }

    #[test]
    fn join_with_timeout_returns_true_for_finished_thread() {
        let handle = std::thread::spawn(|| {});
        std::thread::sleep(Duration::from_millis(10));
        assert!(join_with_timeout(handle, Duration::from_millis(200)));
    }
}
