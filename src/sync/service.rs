//! Sync orchestration (§4.8 step 1 "first-connect detection", §7 "Sync
//! aborts mid-way do not mark 'first connect complete'")
//!
//! Direct line-level grounding on
//! `original_source/remote/domain/sync/service.py::SyncService.sync`: key→
//! password connect fallback, first-connect check before running anything,
//! file/block/script dispatch, and machine registration gated on the whole
//! run succeeding.

use crate::config::ConnectionParams;
use crate::error::{RemoteError, Result};
use crate::ssh::SshClient;
use crate::sync::block_sync::sync_block_groups;
use crate::sync::file_sync::sync_files;
use crate::sync::models::{resolve_machine_id, BlockGroup, FileSync, GlobalEnv, MachineRecord, RemoteHostState, ScriptExec, ScriptMode};
use crate::sync::script_exec::run_scripts;
use std::io::{Read, Write};
use std::path::Path;
use tracing::{info, warn};

const REMOTE_STATE_PATH: &str = ".remote.json";

/// Pure business logic for the declarative sync engine. No CLI/TOML
/// dependency — callers own presentation and config parsing.
pub struct SyncService {
    ssh_port: u16,
}

impl SyncService {
    pub fn new(ssh_port: u16) -> Self {
        Self { ssh_port }
    }

    /// Runs one sync pass: connect, check first-connect, sync files then
    /// blocks then scripts, and on full success register the machine and
    /// bump `lastSync`. Returns whether key auth fell back to password
    /// (§3 `SSHClient` "key fallback signal").
    pub fn sync(
        &self,
        conn_params: &ConnectionParams,
        files: &[FileSync],
        blocks: &[BlockGroup],
        scripts: &[ScriptExec],
        global_env: &GlobalEnv,
        force_init: bool,
    ) -> Result<bool> {
        let client = SshClient::connect(conn_params)?;
        let used_key_fallback = client.used_key_fallback();

        info!(host = conn_params.host, port = conn_params.port, "sync connected");

        let machine_id = resolve_machine_id()?;
        let remote_path = resolve_remote_home_path(&client, REMOTE_STATE_PATH)?;
        let mut state = load_remote_state(&client, &remote_path)?;
        let is_first = state.is_first_connect(&machine_id);

        let scripts_to_run: Vec<&ScriptExec> = scripts
            .iter()
            .filter(|s| {
                if s.mode == ScriptMode::Init && !is_first && !force_init {
                    info!(src = %s.src, "skipping init-mode script: not a first connection");
                    false
                } else {
                    true
                }
            })
            .collect();

        let run_result = self.run_items(&client, files, blocks, &scripts_to_run, global_env, force_init);

        match run_result {
            Ok(()) => {
                let now = now_unix();
                let record = state.machines.entry(machine_id.clone()).or_insert_with(|| MachineRecord {
                    first_connect: now,
                    last_sync: now,
                    meta: serde_json::json!({"client": "remote"}),
                });
                record.last_sync = now;
                if is_first {
                    info!(machine_id = %machine_id, "registering first connection");
                }

                save_remote_state(&client, &remote_path, &state)?;
                info!("sync completed successfully");
                Ok(used_key_fallback)
            }
            Err(e) => {
                if is_first {
                    warn!("sync failed on a first connection; not registering, init items will retry next run");
                }
                Err(e)
            }
        }
    }

    fn run_items(
        &self,
        client: &SshClient,
        files: &[FileSync],
        blocks: &[BlockGroup],
        scripts: &[&ScriptExec],
        global_env: &GlobalEnv,
        force_init: bool,
    ) -> Result<()> {
        if !files.is_empty() {
            sync_files(files, client, self.ssh_port, force_init)?;
        }
        if !blocks.is_empty() {
            sync_block_groups(blocks, client, force_init)?;
        }
        if !scripts.is_empty() {
            let owned: Vec<ScriptExec> = scripts.iter().map(|s| (*s).clone()).collect();
            run_scripts(&owned, client, global_env)?;
        }
        Ok(())
    }
}

fn resolve_remote_home_path(client: &SshClient, file_name: &str) -> Result<String> {
    let result = client.exec("echo $HOME")?;
    let home = String::from_utf8_lossy(&result.stdout).trim().to_string();
    let home = if home.is_empty() { "/root".to_string() } else { home };
    Ok(format!("{}/{}", home, file_name))
}

fn load_remote_state(client: &SshClient, remote_path: &str) -> Result<RemoteHostState> {
    let sftp = client.open_fresh_sftp()?;
    match sftp.open(Path::new(remote_path)) {
        Ok(mut file) => {
            let mut contents = String::new();
            file.read_to_string(&mut contents)
                .map_err(|e| RemoteError::connection(client.host(), e.to_string()))?;
            if contents.trim().is_empty() {
                return Ok(RemoteHostState::default());
            }
            serde_json::from_str(&contents).map_err(|e| RemoteError::ConfigError(format!("corrupt {}: {}", remote_path, e)))
        }
        Err(_) => Ok(RemoteHostState::default()),
    }
}

fn save_remote_state(client: &SshClient, remote_path: &str, state: &RemoteHostState) -> Result<()> {
    let sftp = client.open_fresh_sftp()?;
    let contents = serde_json::to_string_pretty(state)?;
    let mut file = sftp
        .create(Path::new(remote_path))
        .map_err(|e| RemoteError::connection(client.host(), e.to_string()))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| RemoteError::connection(client.host(), e.to_string()))?;
    Ok(())
}

fn now_unix() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::MachineRecord;

    #[test]
    fn first_connect_gated_on_missing_machine_entry() {
        let mut state = RemoteHostState::default();
        assert!(state.is_first_connect("m1"));
        state.machines.insert(
            "m1".to_string(),
            MachineRecord { first_connect: 1, last_sync: 1, meta: serde_json::json!({}) },
        );
        assert!(!state.is_first_connect("m1"));
    }

    #[test]
    fn state_roundtrips_through_json() {
        let mut state = RemoteHostState::default();
        state.machines.insert(
            "abc".to_string(),
            MachineRecord { first_connect: 100, last_sync: 200, meta: serde_json::json!({"client": "remote"}) },
        );
        let json = serde_json::to_string(&state).unwrap();
        let parsed: RemoteHostState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.machines["abc"].last_sync, 200);
    }
}
