//! Connection, transfer, and proxy configuration types
//!
//! Mirrors the data model in §3 of the design: plain, serde-friendly structs
//! with a validation method rather than enforcing invariants in the
//! constructor, so callers built from CLI flags, SSH-config merges, or tests
//! can assemble a value incrementally before checking it.

use crate::error::{RemoteError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// How an [`SshClient`](crate::ssh::SshClient) should authenticate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Password,
    Key,
}

/// Parameters needed to establish an SSH connection.
///
/// Produced by merging CLI flags, an `~/.ssh/config` lookup (see
/// [`SshConfigLoader`]), and explicit defaults; consumed by
/// `SshClient::connect`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    pub user: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub auth_method: AuthMethod,
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
}

fn default_ssh_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    10
}

impl ConnectionParams {
    /// A connection whose auth method is inferred from which fields are
    /// populated: a key path present means key auth (with password fallback
    /// if a password is also given); otherwise password auth.
    pub fn new(host: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            user: user.into(),
            port: default_ssh_port(),
            auth_method: AuthMethod::Password,
            password: None,
            key_path: None,
            timeout: default_timeout(),
        }
    }

    pub fn with_key(mut self, key_path: impl Into<PathBuf>) -> Self {
        self.key_path = Some(key_path.into());
        self.auth_method = AuthMethod::Key;
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }
}

/// Transfer configuration (§3 `TransferConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    pub resume: bool,
    pub force: bool,
    pub parallel: usize,
    pub aria2: bool,
    pub split: usize,
    pub chunk: u64,
    #[serde(default = "default_chunk_min")]
    pub chunk_min: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub limit_rate: Option<u64>,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    pub compress: Option<bool>,
    pub preserve_perms: Option<bool>,
}

fn default_chunk_min() -> u64 {
    1024 * 1024
}

fn default_max_retries() -> u32 {
    3
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            resume: true,
            force: false,
            parallel: 4,
            aria2: false,
            split: 1,
            chunk: 4 * 1024 * 1024,
            chunk_min: default_chunk_min(),
            max_retries: default_max_retries(),
            limit_rate: None,
            ssh_port: default_ssh_port(),
            timeout: default_timeout(),
            compress: None,
            preserve_perms: None,
        }
    }
}

impl TransferConfig {
    /// Validates `parallel ≥ 1`; `chunk ≥ chunkMin` when not aria2;
    /// `split ≥ 1` when aria2 (§3).
    pub fn validate(&self) -> Result<()> {
        if self.parallel < 1 {
            return Err(RemoteError::ConfigError("parallel must be >= 1".into()));
        }
        if self.aria2 {
            if self.split < 1 {
                return Err(RemoteError::ConfigError("split must be >= 1 in aria2 mode".into()));
            }
        } else if self.chunk < self.chunk_min {
            return Err(RemoteError::ConfigError(format!(
                "chunk ({}) must be >= chunkMin ({})",
                self.chunk, self.chunk_min
            )));
        }
        Ok(())
    }
}

/// Which protocol the built-in proxy server speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyMode {
    Http,
    Socks5,
}

/// Proxy configuration (§3 `ProxyConfig`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub local_port: u16,
    pub remote_port: u16,
    pub mode: ProxyMode,
    #[serde(default = "default_local_host")]
    pub local_host: String,
    pub use_builtin: bool,
}

fn default_local_host() -> String {
    "localhost".to_string()
}

impl ProxyConfig {
    /// Ports must be in `[1, 65535]`; both are always in range for `u16`
    /// except 0, which is the only value this rejects.
    pub fn validate(&self) -> Result<()> {
        if self.local_port == 0 {
            return Err(RemoteError::ConfigError(format!(
                "invalid local_port: {}",
                self.local_port
            )));
        }
        if self.remote_port == 0 {
            return Err(RemoteError::ConfigError(format!(
                "invalid remote_port: {}",
                self.remote_port
            )));
        }
        Ok(())
    }
}

/// Tunnel-specific subset of [`ProxyConfig`], persisted alongside
/// [`ProxyState`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub remote_port: u16,
    pub local_host: String,
    pub local_port: u16,
}

/// Persisted state for a named proxy instance (§3 `ProxyState`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyState {
    pub name: String,
    pub config: ProxyConfig,
    pub ssh_host: String,
    pub pid: i32,
    pub started_at: f64,
    pub tunnel: TunnelConfig,
}

/// Parses human-readable size literals: `^\d+(B|K|KB|M|MB|G|GB|T|TB)?$`
/// case-insensitive, base-1024 (§6).
pub fn parse_size(size: &str) -> std::result::Result<u64, String> {
    let size = size.trim().to_uppercase();

    if size.is_empty() {
        return Err("empty size string".to_string());
    }

    let (num_str, multiplier) = if size.ends_with("TB") || size.ends_with('T') {
        (size.trim_end_matches(|c| c == 'T' || c == 'B'), 1024u64.pow(4))
    } else if size.ends_with("GB") || size.ends_with('G') {
        (size.trim_end_matches(|c| c == 'G' || c == 'B'), 1024u64.pow(3))
    } else if size.ends_with("MB") || size.ends_with('M') {
        (size.trim_end_matches(|c| c == 'M' || c == 'B'), 1024u64.pow(2))
    } else if size.ends_with("KB") || size.ends_with('K') {
        (size.trim_end_matches(|c| c == 'K' || c == 'B'), 1024u64)
    } else if size.ends_with('B') {
        (size.trim_end_matches('B'), 1u64)
    } else {
        (size.as_str(), 1u64)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid number: {}", num_str))?;

    Ok(num * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_literals() {
        assert_eq!(parse_size("0").unwrap(), 0);
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("1K").unwrap(), 1024);
        assert_eq!(parse_size("1KB").unwrap(), 1024);
        assert_eq!(parse_size("1m").unwrap(), 1024 * 1024);
        assert_eq!(parse_size("2MB").unwrap(), 2 * 1024 * 1024);
        assert_eq!(parse_size("1G").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_size("1TB").unwrap(), 1024u64.pow(4));
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("abc").is_err());
    }

    #[test]
    fn transfer_config_validation() {
        let mut cfg = TransferConfig::default();
        cfg.parallel = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = TransferConfig::default();
        cfg.chunk = 100;
        cfg.chunk_min = 1024 * 1024;
        assert!(cfg.validate().is_err());

        let mut cfg = TransferConfig::default();
        cfg.aria2 = true;
        cfg.split = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn proxy_config_validation() {
        let cfg = ProxyConfig {
            local_port: 0,
            remote_port: 1081,
            mode: ProxyMode::Socks5,
            local_host: "localhost".into(),
            use_builtin: true,
        };
        assert!(cfg.validate().is_err());
    }
}
