//! SCP-style endpoint parsing
//!
//! Parses `[user@]host:path` and plain local paths into an [`Endpoint`],
//! resolving `~` against the remote `$HOME` once a client is connected.

use crate::config::SshConfigLoader;
use crate::error::{RemoteError, Result};
use crate::ssh::SshClient;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A local or remote path, as produced by [`parse_scp_path`].
///
/// Invariant: `is_local ⟺ host.is_none()`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Endpoint {
    pub path: String,
    pub is_local: bool,
    pub host: Option<String>,
    pub user: Option<String>,
    pub port: u16,
    pub key_file: Option<PathBuf>,
}

impl Endpoint {
    pub fn local(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_local: true,
            host: None,
            user: None,
            port: 22,
            key_file: None,
        }
    }

    /// Normalized `host:user:port:path` key used for manifest hashing
    /// (§4.5 step 5); local endpoints use an empty host/user.
    pub fn normalized_key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.host.as_deref().unwrap_or(""),
            self.user.as_deref().unwrap_or(""),
            self.port,
            self.path
        )
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_local {
            write!(f, "{}", self.path)
        } else if let Some(user) = &self.user {
            write!(f, "{}@{}:{}", user, self.host.as_deref().unwrap_or(""), self.path)
        } else {
            write!(f, "{}:{}", self.host.as_deref().unwrap_or(""), self.path)
        }
    }
}

/// Parses `path` as an SCP-style endpoint: no colon means a local path;
/// otherwise `[user@]host:path`, with an `~/.ssh/config` lookup for the
/// host's `User`/`Port`/`IdentityFile`.
pub fn parse_scp_path(path: &str, default_port: u16) -> Result<Endpoint> {
    if !path.contains(':') {
        let expanded = shellexpand_home(path);
        return Ok(Endpoint::local(expanded));
    }

    let (host_part, remote_path) = path
        .split_once(':')
        .ok_or_else(|| RemoteError::ConfigError(format!("invalid remote path format: {}", path)))?;

    let (user, host) = match host_part.rsplit_once('@') {
        Some((user, host)) => (Some(user.to_string()), host.to_string()),
        None => (None, host_part.to_string()),
    };

    let ssh_cfg = SshConfigLoader::load_default().ok();
    let host_cfg = ssh_cfg.as_ref().and_then(|cfg| cfg.get(&host));

    let resolved_host = host_cfg
        .and_then(|h| h.host_name.clone())
        .unwrap_or_else(|| host.clone());
    let resolved_user = host_cfg.and_then(|h| h.user.clone()).or(user);
    let resolved_port = host_cfg.and_then(|h| h.port).unwrap_or(default_port);
    let key_file = host_cfg.and_then(|h| h.identity_file.clone());

    Ok(Endpoint {
        path: remote_path.to_string(),
        is_local: false,
        host: Some(resolved_host),
        user: resolved_user,
        port: resolved_port,
        key_file,
    })
}

fn shellexpand_home(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(stripped).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

/// Resolves `~` in a remote path against the client's actual `$HOME`.
/// Local endpoints are returned unchanged.
pub fn resolve_remote_path(client: &SshClient, endpoint: &Endpoint) -> Result<String> {
    if endpoint.is_local {
        return Ok(endpoint.path.clone());
    }

    let path = &endpoint.path;

    if let Some(rest) = path.strip_prefix('~') {
        let result = client.exec("echo $HOME")?;
        let home = String::from_utf8_lossy(&result.stdout).trim().to_string();
        let home = if home.is_empty() { "/root".to_string() } else { home };
        if rest.is_empty() {
            return Ok(home);
        }
        return Ok(format!("{}{}", home, rest));
    }

    Ok(path.clone())
}

/// Manifest key: SHA-256 of `src_key|dst_key` where each key is
/// `host:user:port:path` (§3, §4.5 step 5).
pub fn generate_manifest_key(src: &Endpoint, dst: &Endpoint) -> String {
    use sha2::{Digest, Sha256};
    let combined = format!("{}|{}", src.normalized_key(), dst.normalized_key());
    let digest = Sha256::digest(combined.as_bytes());
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_local_path() {
        let ep = parse_scp_path("/tmp/file.txt", 22).unwrap();
        assert!(ep.is_local);
        assert_eq!(ep.path, "/tmp/file.txt");
    }

    #[test]
    fn parses_user_host_path() {
        let ep = parse_scp_path("deploy@example.com:/var/www/app", 22).unwrap();
        assert!(!ep.is_local);
        assert_eq!(ep.user.as_deref(), Some("deploy"));
        assert_eq!(ep.host.as_deref(), Some("example.com"));
        assert_eq!(ep.path, "/var/www/app");
    }

    #[test]
    fn parses_host_only_path() {
        let ep = parse_scp_path("example.com:~/file.txt", 22).unwrap();
        assert!(!ep.is_local);
        assert_eq!(ep.user, None);
        assert_eq!(ep.path, "~/file.txt");
    }

    #[test]
    fn manifest_key_is_stable() {
        let src = Endpoint::local("/tmp/a");
        let dst = parse_scp_path("user@host:/tmp/b", 22).unwrap();
        let k1 = generate_manifest_key(&src, &dst);
        let k2 = generate_manifest_key(&src, &dst);
        assert_eq!(k1, k2);
        assert_eq!(k1.len(), 64);
    }

    #[test]
    fn display_formats_match_scp_style() {
        let local = Endpoint::local("/tmp/a");
        assert_eq!(local.to_string(), "/tmp/a");

        let remote = parse_scp_path("user@host:/tmp/b", 22).unwrap();
        assert_eq!(remote.to_string(), "user@host:/tmp/b");
    }
}
