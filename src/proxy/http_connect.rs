//! HTTP CONNECT handshake, bit-exact per §4.3
//!
//! No source implementation exists for the built-in proxy server; grounded
//! directly on the spec's wire description and written in the same
//! explicit `Read`/`Write` style as [`crate::proxy::socks5`]. Generic over
//! any `Read + Write` stream for the same reason as `socks5`: the handshake
//! runs over a local `TcpStream` or a forwarded SSH `Channel`.

use super::ConnectTarget;
use crate::error::{RemoteError, Result};
use std::io::{Read, Write};

pub const REPLY_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";
pub const REPLY_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
pub const REPLY_METHOD_NOT_ALLOWED: &[u8] = b"HTTP/1.1 405 Method Not Allowed\r\n\r\n";

/// Reads a single CRLF-terminated request line and parses it as
/// `CONNECT host:port HTTP/x`. Any other verb is rejected with `405`
/// (caller still must send that reply; this only classifies the error).
pub fn read_connect_request<S: Read + Write>(stream: &mut S) -> Result<ConnectTarget> {
    let line = read_request_line(stream)?;
    let mut parts = line.split_whitespace();

    let method = parts
        .next()
        .ok_or_else(|| RemoteError::ProxyError("empty HTTP request line".into()))?;
    let target = parts
        .next()
        .ok_or_else(|| RemoteError::ProxyError("missing CONNECT target".into()))?;
    let _version = parts.next();

    if !method.eq_ignore_ascii_case("CONNECT") {
        send_reply(stream, REPLY_METHOD_NOT_ALLOWED).ok();
        return Err(RemoteError::ProxyError(format!("unsupported HTTP method: {}", method)));
    }

    let (host, port_str) = target
        .rsplit_once(':')
        .ok_or_else(|| RemoteError::ProxyError(format!("invalid CONNECT target: {}", target)))?;
    let port: u16 = port_str
        .parse()
        .map_err(|_| RemoteError::ProxyError(format!("invalid CONNECT port: {}", port_str)))?;

    // Drain the remaining headers up to the blank line; their contents are
    // not inspected (no auth/host-allowlist feature in scope).
    drain_headers(stream)?;

    Ok(ConnectTarget {
        host: host.to_string(),
        port,
    })
}

fn read_request_line<S: Read + Write>(stream: &mut S) -> Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream
            .read_exact(&mut byte)
            .map_err(|e| RemoteError::ProxyError(format!("HTTP request line read failed: {}", e)))?;
        if byte[0] == b'\n' {
            break;
        }
        if byte[0] != b'\r' {
            line.push(byte[0]);
        }
    }
    String::from_utf8(line).map_err(|e| RemoteError::ProxyError(format!("HTTP request line is not valid utf-8: {}", e)))
}

fn drain_headers<S: Read + Write>(stream: &mut S) -> Result<()> {
    loop {
        let line = read_request_line(stream)?;
        if line.is_empty() {
            return Ok(());
        }
    }
}

pub fn send_reply<S: Read + Write>(stream: &mut S, reply: &[u8]) -> Result<()> {
    stream
        .write_all(reply)
        .map_err(|e| RemoteError::ProxyError(format!("HTTP reply write failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (client, server)
    }

    #[test]
    fn parses_connect_request() {
        let (mut client, mut server) = loopback_pair();
        std::thread::spawn(move || {
            client
                .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
                .unwrap();
        });
        let target = read_connect_request(&mut server).unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 443);
    }

    #[test]
    fn rejects_get_method() {
        let (mut client, mut server) = loopback_pair();
        std::thread::spawn(move || {
            client.write_all(b"GET / HTTP/1.1\r\n\r\n").unwrap();
        });
        assert!(read_connect_request(&mut server).is_err());
    }

    #[test]
    fn rejects_malformed_target() {
        let (mut client, mut server) = loopback_pair();
        std::thread::spawn(move || {
            client.write_all(b"CONNECT garbage HTTP/1.1\r\n\r\n").unwrap();
        });
        assert!(read_connect_request(&mut server).is_err());
    }
}
