//! SOCKS5 handshake (RFC 1928 subset), bit-exact per §4.3
//!
//! No source implementation exists for the built-in proxy server (only the
//! reverse-tunnel-to-external-proxy path is in `original_source/`); this is
//! implemented directly from the wire-format description, in the explicit
//! `Read`/`Write` I/O style of [`crate::ssh::SshClient`]. Generic over any
//! `Read + Write` stream since the handshake runs over a local `TcpStream`
//! in built-in-listener mode, or directly over a forwarded SSH `Channel`
//! when the remote end connects through the reverse tunnel.

use super::ConnectTarget;
use crate::error::{RemoteError, Result};
use std::io::{Read, Write};

const SOCKS5_VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REPLY_SUCCESS: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REPLY_GENERAL_FAILURE: u8 = 0x05;

/// Runs the SOCKS5 handshake on `stream`: method negotiation, then the
/// CONNECT request. Returns the requested target on success; the caller is
/// responsible for sending the final success/failure reply once it knows
/// whether the outbound connection succeeded (§4.3 steps 1-4).
pub fn handshake<S: Read + Write>(stream: &mut S) -> Result<ConnectTarget> {
    negotiate_method(stream)?;
    read_connect_request(stream)
}

fn negotiate_method<S: Read + Write>(stream: &mut S) -> Result<()> {
    let mut header = [0u8; 2];
    stream
        .read_exact(&mut header)
        .map_err(|e| RemoteError::ProxyError(format!("socks5 greeting read failed: {}", e)))?;

    let (version, n_methods) = (header[0], header[1] as usize);
    if version != SOCKS5_VERSION {
        return Err(RemoteError::ProxyError(format!("unsupported socks version: {}", version)));
    }

    let mut methods = vec![0u8; n_methods];
    stream
        .read_exact(&mut methods)
        .map_err(|e| RemoteError::ProxyError(format!("socks5 methods read failed: {}", e)))?;

    stream
        .write_all(&[SOCKS5_VERSION, REPLY_SUCCESS])
        .map_err(|e| RemoteError::ProxyError(format!("socks5 method reply failed: {}", e)))?;

    Ok(())
}

fn read_connect_request<S: Read + Write>(stream: &mut S) -> Result<ConnectTarget> {
    let mut header = [0u8; 4];
    stream
        .read_exact(&mut header)
        .map_err(|e| RemoteError::ProxyError(format!("socks5 request read failed: {}", e)))?;

    let (version, cmd, _reserved, atyp) = (header[0], header[1], header[2], header[3]);
    if version != SOCKS5_VERSION {
        return Err(RemoteError::ProxyError(format!("unsupported socks version: {}", version)));
    }

    if cmd != CMD_CONNECT {
        send_reply(stream, REPLY_COMMAND_NOT_SUPPORTED, ATYP_IPV4, &[0, 0, 0, 0], 0).ok();
        return Err(RemoteError::ProxyError(format!("unsupported socks5 command: {}", cmd)));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream
                .read_exact(&mut addr)
                .map_err(|e| RemoteError::ProxyError(format!("socks5 ipv4 read failed: {}", e)))?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            stream
                .read_exact(&mut len_buf)
                .map_err(|e| RemoteError::ProxyError(format!("socks5 domain length read failed: {}", e)))?;
            let mut domain = vec![0u8; len_buf[0] as usize];
            stream
                .read_exact(&mut domain)
                .map_err(|e| RemoteError::ProxyError(format!("socks5 domain read failed: {}", e)))?;
            String::from_utf8(domain)
                .map_err(|e| RemoteError::ProxyError(format!("socks5 domain is not valid utf-8: {}", e)))?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream
                .read_exact(&mut addr)
                .map_err(|e| RemoteError::ProxyError(format!("socks5 ipv6 read failed: {}", e)))?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        other => {
            send_reply(stream, REPLY_GENERAL_FAILURE, ATYP_IPV4, &[0, 0, 0, 0], 0).ok();
            return Err(RemoteError::ProxyError(format!("unsupported socks5 address type: {}", other)));
        }
    };

    let mut port_buf = [0u8; 2];
    stream
        .read_exact(&mut port_buf)
        .map_err(|e| RemoteError::ProxyError(format!("socks5 port read failed: {}", e)))?;
    let port = u16::from_be_bytes(port_buf);

    Ok(ConnectTarget { host, port })
}

/// Sends the final SOCKS5 reply (§4.3 steps 4-5). On success, `bind_addr`/
/// `bind_port` should reflect the locally-opened outbound connection; on
/// failure the all-zero IPv4 address is conventional and what callers pass.
pub fn send_reply<S: Read + Write>(stream: &mut S, reply_code: u8, atyp: u8, bind_addr: &[u8], bind_port: u16) -> Result<()> {
    let mut reply = vec![SOCKS5_VERSION, reply_code, 0x00, atyp];
    reply.extend_from_slice(bind_addr);
    reply.extend_from_slice(&bind_port.to_be_bytes());
    stream
        .write_all(&reply)
        .map_err(|e| RemoteError::ProxyError(format!("socks5 reply write failed: {}", e)))
}

pub fn send_success<S: Read + Write>(stream: &mut S) -> Result<()> {
    send_reply(stream, REPLY_SUCCESS, ATYP_IPV4, &[0, 0, 0, 0], 0)
}

pub fn send_failure<S: Read + Write>(stream: &mut S) -> Result<()> {
    send_reply(stream, REPLY_GENERAL_FAILURE, ATYP_IPV4, &[0, 0, 0, 0], 0)
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
    fn negotiates_no_auth_method() {
        let (mut client, mut server) = loopback_pair();
        std::thread::spawn(move || {
            client.write_all(&[0x05, 0x01, 0x00]).unwrap();
            let mut reply = [0u8; 2];
            client.read_exact(&mut reply).unwrap();
            assert_eq!(reply, [0x05, 0x00]);
        });
        negotiate_method(&mut server).unwrap();
    }

    #[test]
    fn parses_domain_connect_request() {
        let (mut client, mut server) = loopback_pair();
        std::thread::spawn(move || {
            let mut req = vec![0x05, 0x01, 0x00, 0x03, 11];
            req.extend_from_slice(b"example.com");
            req.extend_from_slice(&80u16.to_be_bytes());
            client.write_all(&req).unwrap();
        });
        let target = read_connect_request(&mut server).unwrap();
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);
    }

    #[test]
    fn parses_ipv4_connect_request() {
        let (mut client, mut server) = loopback_pair();
        std::thread::spawn(move || {
            let mut req = vec![0x05, 0x01, 0x00, 0x01];
            req.extend_from_slice(&[93, 184, 216, 34]);
            req.extend_from_slice(&443u16.to_be_bytes());
            client.write_all(&req).unwrap();
        });
        let target = read_connect_request(&mut server).unwrap();
        assert_eq!(target.host, "93.184.216.34");
        assert_eq!(target.port, 443);
    }

    #[test]
    fn rejects_non_connect_command() {
        let (mut client, mut server) = loopback_pair();
        std::thread::spawn(move || {
            let mut req = vec![0x05, 0x02, 0x00, 0x01];
            req.extend_from_slice(&[0, 0, 0, 0]);
            req.extend_from_slice(&0u16.to_be_bytes());
            client.write_all(&req).unwrap();
        });
        assert!(read_connect_request(&mut server).is_err());
    }
}
