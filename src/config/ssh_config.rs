//! Minimal `~/.ssh/config` reader
//!
//! Honors `HostName`, `User`, `Port`, and `IdentityFile` only (first entry if
//! a host block repeats the directive). No `Match`/`Include` support — this
//! is a best-effort merge layer, not a full OpenSSH config parser.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// One `Host` block's recognized directives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SshConfigHost {
    pub host_name: Option<String>,
    pub user: Option<String>,
    pub port: Option<u16>,
    pub identity_file: Option<PathBuf>,
}

/// Parsed `~/.ssh/config`, queryable by host alias.
#[derive(Debug, Clone, Default)]
pub struct SshConfigLoader {
    hosts: HashMap<String, SshConfigHost>,
}

impl SshConfigLoader {
    /// Loads and parses `path`. A missing file yields an empty loader rather
    /// than an error — an SSH config is optional ambient context.
    pub fn load(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Ok(Self::parse(&content))
    }

    /// Loads `~/.ssh/config` for the current user, if resolvable.
    pub fn load_default() -> std::io::Result<Self> {
        match dirs_home() {
            Some(home) => Self::load(home.join(".ssh").join("config")),
            None => Ok(Self::default()),
        }
    }

    fn parse(content: &str) -> Self {
        let mut hosts: HashMap<String, SshConfigHost> = HashMap::new();
        let mut current: Vec<String> = Vec::new();

        for raw_line in content.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (keyword, rest) = match line.split_once(char::is_whitespace) {
                Some((k, r)) => (k.trim(), r.trim()),
                None => continue,
            };
            let keyword_lower = keyword.to_ascii_lowercase();

            if keyword_lower == "host" {
                current = rest.split_whitespace().map(|s| s.to_string()).collect();
                for alias in &current {
                    hosts.entry(alias.clone()).or_default();
                }
                continue;
            }

            if current.is_empty() {
                continue;
            }

            for alias in &current {
                let entry = hosts.entry(alias.clone()).or_default();
                match keyword_lower.as_str() {
                    "hostname" if entry.host_name.is_none() => {
                        entry.host_name = Some(rest.to_string());
                    }
                    "user" if entry.user.is_none() => {
                        entry.user = Some(rest.to_string());
                    }
                    "port" if entry.port.is_none() => {
                        entry.port = rest.parse().ok();
                    }
                    "identityfile" if entry.identity_file.is_none() => {
                        entry.identity_file = Some(PathBuf::from(expand_tilde(rest)));
                    }
                    _ => {}
                }
            }
        }

        Self { hosts }
    }

    /// Looks up a host alias (e.g. the `Host` line, not necessarily the
    /// resolved `HostName`). Wildcard patterns are not matched — only exact
    /// alias names.
    pub fn get(&self, alias: &str) -> Option<&SshConfigHost> {
        self.hosts.get(alias)
    }
}

fn expand_tilde(path: &str) -> String {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(stripped).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_host_block() {
        let cfg = SshConfigLoader::parse(
            "Host myserver\n  HostName 10.0.0.1\n  User deploy\n  Port 2222\n  IdentityFile ~/.ssh/id_ed25519\n",
        );
        let host = cfg.get("myserver").expect("host present");
        assert_eq!(host.host_name.as_deref(), Some("10.0.0.1"));
        assert_eq!(host.user.as_deref(), Some("deploy"));
        assert_eq!(host.port, Some(2222));
        assert!(host.identity_file.is_some());
    }

    #[test]
    fn first_identity_file_wins() {
        let cfg = SshConfigLoader::parse(
            "Host a\n  IdentityFile ~/.ssh/first\n  IdentityFile ~/.ssh/second\n",
        );
        let host = cfg.get("a").unwrap();
        assert!(host
            .identity_file
            .as_ref()
            .unwrap()
            .to_string_lossy()
            .ends_with("first"));
    }

    #[test]
    fn unknown_host_is_none() {
        let cfg = SshConfigLoader::parse("Host a\n  User x\n");
        assert!(cfg.get("b").is_none());
    }

    #[test]
    fn ignores_unrecognized_directives() {
        let cfg = SshConfigLoader::parse(
            "Host a\n  ForwardAgent yes\n  ServerAliveInterval 60\n  User real\n",
        );
        let host = cfg.get("a").unwrap();
        assert_eq!(host.user.as_deref(), Some("real"));
    }

    #[test]
    fn multiple_aliases_share_block() {
        let cfg = SshConfigLoader::parse("Host a b\n  User shared\n");
        assert_eq!(cfg.get("a").unwrap().user.as_deref(), Some("shared"));
        assert_eq!(cfg.get("b").unwrap().user.as_deref(), Some("shared"));
    }
}
