//! Sync domain models (§3: `FileSync`, `TextBlock`, `BlockGroup`,
//! `ScriptExec`, `RemoteHostState`)
//!
//! Field-for-field grounded on `original_source/remote/domain/sync/models.py`,
//! with string-valued `mode` fields replaced by tagged enums per §9
//! "Dynamic behavior → tagged sums".

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Per-item mode for [`FileSync`] (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileSyncMode {
    /// Write destination only if it does not exist.
    Init,
    /// Unconditionally copy src→dst.
    Cover,
    /// Bidirectional by mtime; newer side wins.
    Sync,
    /// One-directional by mtime; remote↔remote is a hard error.
    Update,
}

/// A single declared file-sync item. Either endpoint may be local or
/// remote; which one is local is discovered by parsing `src`/`dist` as
/// SCP-style paths at sync time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileSync {
    pub src: String,
    pub dist: String,
    pub mode: FileSyncMode,
}

/// Per-block mode for [`TextBlock`] (§4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockMode {
    /// Write only if the wrapper doesn't already exist.
    Init,
    /// Update based on mtime/hash comparison; refuses hand-edited blocks.
    Update,
    /// Force overwrite.
    Cover,
}

/// One block: a named region sourced from the concatenation of one or more
/// local files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextBlock {
    pub src: Vec<String>,
    pub mode: BlockMode,
}

impl TextBlock {
    /// The block's identifier: the resolved absolute path of its first
    /// source file (§3 `TextBlock`, §4.7).
    pub fn name(&self) -> crate::error::Result<String> {
        let first = self
            .src
            .first()
            .ok_or_else(|| crate::error::RemoteError::BlockSyncError("TextBlock must have at least one src file".into()))?;
        let expanded = expand_tilde(first);
        let resolved = std::fs::canonicalize(&expanded).unwrap_or(expanded);
        Ok(resolved.to_string_lossy().into_owned())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            return PathBuf::from(home).join(rest);
        }
    }
    PathBuf::from(path)
}

/// Rebuild discipline for a [`BlockGroup`]'s wrapper region (§3, §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    /// Preserve previously-existing blocks not in the current declaration.
    Incremental,
    /// Delete unknown blocks; the wrapper contains only what's declared.
    Overwrite,
}

/// A remote file owning a single wrapper region containing one or more
/// blocks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockGroup {
    pub dist: String,
    pub mode: GroupMode,
    pub blocks: Vec<TextBlock>,
}

/// Global interpreter defaults used when a [`ScriptExec`] doesn't specify
/// its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalEnv {
    pub interpreter: String,
    pub flags: Option<Vec<String>>,
}

impl Default for GlobalEnv {
    fn default() -> Self {
        Self {
            interpreter: "/bin/bash".to_string(),
            flags: None,
        }
    }
}

/// When a [`ScriptExec`] runs (§3, §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScriptMode {
    /// Only on a machine's first connection.
    Init,
    /// Every sync run.
    Always,
}

/// How a [`ScriptExec`]'s command line is built (§4.8 step 4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecMode {
    /// `<interp> <flags> <path> <args>`
    Exec,
    /// `<globalInterp> <globalFlags> -c "source <path> <args>"`
    Source,
}

/// One script execution unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptExec {
    /// Local path, or a remote path if prefixed with `:`.
    pub src: String,
    #[serde(default = "default_script_mode")]
    pub mode: ScriptMode,
    #[serde(default = "default_exec_mode")]
    pub exec_mode: ExecMode,
    pub interpreter: Option<String>,
    pub flags: Option<Vec<String>>,
    pub args: Option<Vec<String>>,
    #[serde(default)]
    pub interactive: bool,
    #[serde(default)]
    pub allow_fail: bool,
}

fn default_script_mode() -> ScriptMode {
    ScriptMode::Always
}

fn default_exec_mode() -> ExecMode {
    ExecMode::Exec
}

impl ScriptExec {
    /// `true` if `src` is a `:`-prefixed remote path rather than a local
    /// file to upload.
    pub fn is_remote_src(&self) -> bool {
        self.src.starts_with(':')
    }

    pub fn remote_src_path(&self) -> &str {
        self.src.strip_prefix(':').unwrap_or(&self.src)
    }
}

/// One machine's record in the remote `~/.remote.json` state file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineRecord {
    pub first_connect: i64,
    pub last_sync: i64,
    #[serde(default)]
    pub meta: serde_json::Value,
}

/// Persisted as `~/.remote.json` on the remote (§3 `RemoteHostState`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteHostState {
    #[serde(default)]
    pub machines: HashMap<String, MachineRecord>,
}

impl RemoteHostState {
    pub fn is_first_connect(&self, machine_id: &str) -> bool {
        !self.machines.contains_key(machine_id)
    }
}

/// Path to the local fallback machine-id file (§6 "Persisted state").
fn local_machine_id_path() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(".remote").join("machine-id")
}

/// Candidate OS-provided machine-id files, most to least authoritative.
const OS_MACHINE_ID_PATHS: &[&str] = &["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Resolves this machine's stable identifier: an OS-provided machine-id
/// file if one is readable and non-empty, otherwise a UUID persisted at
/// `~/.remote/machine-id`, generating and saving one on first use (§3, §6,
/// GLOSSARY "Machine ID").
pub fn resolve_machine_id() -> crate::error::Result<String> {
    for path in OS_MACHINE_ID_PATHS {
        if let Ok(contents) = std::fs::read_to_string(path) {
            let trimmed = contents.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }
    }

    let fallback_path = local_machine_id_path();
    if let Ok(contents) = std::fs::read_to_string(&fallback_path) {
        let trimmed = contents.trim();
        if !trimmed.is_empty() {
            return Ok(trimmed.to_string());
        }
    }

    let id = uuid::Uuid::new_v4().simple().to_string();
    if let Some(parent) = fallback_path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| crate::error::RemoteError::io(parent, e))?;
    }
    std::fs::write(&fallback_path, &id).map_err(|e| crate::error::RemoteError::io(&fallback_path, e))?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_name_uses_first_src() {
        let block = TextBlock {
            src: vec!["/tmp/does-not-exist-xyz".into(), "/tmp/other".into()],
            mode: BlockMode::Update,
        };
        let name = block.name().unwrap();
        assert!(name.ends_with("does-not-exist-xyz"));
    }

    #[test]
    fn script_remote_src_detection() {
        let local = ScriptExec {
            src: "setup.sh".into(),
            mode: ScriptMode::Always,
            exec_mode: ExecMode::Exec,
            interpreter: None,
            flags: None,
            args: None,
            interactive: false,
            allow_fail: false,
        };
        assert!(!local.is_remote_src());

        let remote = ScriptExec { src: ":/opt/scripts/setup.sh".into(), ..local };
        assert!(remote.is_remote_src());
        assert_eq!(remote.remote_src_path(), "/opt/scripts/setup.sh");
    }

    #[test]
    fn remote_host_state_first_connect() {
        let state = RemoteHostState::default();
        assert!(state.is_first_connect("abc123"));
    }
}
