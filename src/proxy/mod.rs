//! Reverse Proxy Tunnel Engine (§4.3, §5)
//!
//! SSH reverse port-forward plus an optional built-in SOCKS5/HTTP-CONNECT
//! proxy server. [`tunnel`] owns the acceptor/splicer threads, [`socks5`] and
//! [`http_connect`] implement the two handshakes, and [`service`] ties them
//! to the on-disk instance lifecycle ([`crate::state::FileStateStore`]).

mod http_connect;
mod service;
mod socks5;
mod tunnel;

pub use service::ProxyService;
pub use tunnel::{ForwardTarget, ReverseTunnel};

use crate::config::ProxyMode;
use crate::error::{RemoteError, Result};
use crate::ssh::SshClient;
use std::io::{Read, Write};
use std::sync::atomic::AtomicBool;
use tunnel::{splice, SpliceEnd};

/// The target a proxy client asked to reach, extracted from whichever
/// handshake (SOCKS5 or HTTP CONNECT) ran on the connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
}

/// Runs the handshake for `mode` on `stream`, returning the requested
/// target. Shared by the built-in listener ([`service`]) and the
/// reverse-tunnel-accepted-connection path ([`tunnel`]), since both need the
/// same protocol logic over different stream types (§4.3).
pub(crate) fn run_handshake<S: Read + Write>(mode: ProxyMode, stream: &mut S) -> Result<ConnectTarget> {
    match mode {
        ProxyMode::Socks5 => socks5::handshake(stream),
        ProxyMode::Http => http_connect::read_connect_request(stream),
    }
}

/// Sends the mode-appropriate "connection established" reply.
pub(crate) fn send_success<S: Read + Write>(mode: ProxyMode, stream: &mut S) -> Result<()> {
    match mode {
        ProxyMode::Socks5 => socks5::send_success(stream),
        ProxyMode::Http => http_connect::send_reply(stream, http_connect::REPLY_ESTABLISHED),
    }
}

/// Sends the mode-appropriate failure reply when the outbound
/// `direct-tcpip` dial fails.
pub(crate) fn send_failure<S: Read + Write>(mode: ProxyMode, stream: &mut S) -> Result<()> {
    match mode {
        ProxyMode::Socks5 => socks5::send_failure(stream),
        ProxyMode::Http => http_connect::send_reply(stream, http_connect::REPLY_BAD_GATEWAY),
    }
}

/// Runs the proxy handshake on `stream`, dials the resolved target via
/// `direct-tcpip`, and splices `stream <-> channel` until either side
/// closes. Shared by the built-in listener's local sockets ([`service`])
/// and the reverse-tunnel-accepted channels in builtin-proxy mode
/// ([`tunnel`]) — both need the same dial-then-splice sequence, just over a
/// different stream type for the client-facing end (§4.3).
pub(crate) fn proxy_one_connection<S: SpliceEnd>(
    mut stream: S,
    client: &SshClient,
    mode: ProxyMode,
    running: &AtomicBool,
) -> Result<()> {
    // Blocking reads make the handshake's fixed-size `read_exact` calls
    // straightforward; this is the only user of the session during the
    // handshake window.
    client.set_session_blocking(true);

    let dial_result = run_handshake(mode, &mut stream).and_then(|dest| {
        client.open_direct_tcpip(&dest.host, dest.port).map_err(|e| {
            RemoteError::ProxyError(format!("direct-tcpip to {}:{} failed: {}", dest.host, dest.port, e))
        })
    });

    let out_channel = match dial_result {
        Ok(out_channel) => {
            send_success(mode, &mut stream).ok();
            out_channel
        }
        Err(e) => {
            send_failure(mode, &mut stream).ok();
            return Err(e);
        }
    };

    client.set_session_blocking(false);
    splice(stream, out_channel, running)
}
