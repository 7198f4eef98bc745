//! Process-local state store
//!
//! Keyed JSON blobs plus PID files on disk, rooted at `~/.remote/proxy` by
//! default. Liveness is signal-0 on the stored PID; `list`/`exists`
//! self-heal stale entries by deleting them rather than reporting a dead
//! instance as present.

use crate::error::{RemoteError, Result};
use serde_json::Value;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use nix::sys::signal::kill;
#[cfg(unix)]
use nix::unistd::Pid;

fn default_state_dir() -> PathBuf {
    let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
    home.join(".remote").join("proxy")
}

/// A PID-aware, named JSON blob store (§4.2).
pub struct FileStateStore {
    dir: PathBuf,
}

impl FileStateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The default store rooted at `~/.remote/proxy`.
    pub fn default_store() -> Self {
        Self::new(default_state_dir())
    }

    fn ensure_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| RemoteError::io(&self.dir, e))
    }

    fn json_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    fn pid_path(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.pid", name))
    }

    /// Path to the append-only background log for `stream` (`"out"` or
    /// `"err"`).
    pub fn log_file(&self, name: &str, stream: &str) -> PathBuf {
        self.dir.join(format!("{}.{}", name, stream))
    }

    /// Writes `blob` as pretty-printed JSON.
    pub fn save(&self, name: &str, blob: &Value) -> Result<()> {
        self.ensure_dir()?;
        let path = self.json_path(name);
        let contents = serde_json::to_string_pretty(blob)?;
        std::fs::write(&path, contents).map_err(|e| RemoteError::io(&path, e))
    }

    /// Reads and parses the JSON blob. Returns `None` if missing or
    /// unparseable (a corrupt state file is not fatal — it is treated as
    /// "no saved state").
    pub fn load(&self, name: &str) -> Option<Value> {
        let path = self.json_path(name);
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Removes the PID and JSON files, leaving `.out`/`.err` logs in place
    /// for post-mortem debugging.
    pub fn delete(&self, name: &str) -> Result<()> {
        let json_path = self.json_path(name);
        let pid_path = self.pid_path(name);
        if json_path.exists() {
            std::fs::remove_file(&json_path).map_err(|e| RemoteError::io(&json_path, e))?;
        }
        if pid_path.exists() {
            std::fs::remove_file(&pid_path).map_err(|e| RemoteError::io(&pid_path, e))?;
        }
        Ok(())
    }

    pub fn save_pid(&self, name: &str, pid: i32) -> Result<()> {
        self.ensure_dir()?;
        let path = self.pid_path(name);
        std::fs::write(&path, format!("{}\n", pid)).map_err(|e| RemoteError::io(&path, e))
    }

    pub fn load_pid(&self, name: &str) -> Option<i32> {
        let contents = std::fs::read_to_string(self.pid_path(name)).ok()?;
        contents.trim().parse().ok()
    }

    /// `true` iff the PID file exists and `kill -0 pid` succeeds. If the
    /// liveness check fails, the stale entry is deleted and `false` is
    /// returned.
    pub fn exists(&self, name: &str) -> bool {
        let Some(pid) = self.load_pid(name) else { return false };
        if process_alive(pid) {
            true
        } else {
            let _ = self.delete(name);
            false
        }
    }

    /// Lists only instances whose PID is alive, deleting stale entries as a
    /// side effect.
    pub fn list(&self) -> Vec<String> {
        let mut names = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.dir) else { return names };

        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let Some(name) = path.file_stem().and_then(|s| s.to_str()) else { continue };
            if self.exists(name) {
                names.push(name.to_string());
            }
        }

        names.sort();
        names
    }
}

#[cfg(unix)]
fn process_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: i32) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn save_and_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save("inst1", &json!({"a": 1})).unwrap();
        assert_eq!(store.load("inst1").unwrap()["a"], 1);
    }

    #[test]
    fn load_missing_is_none() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        assert!(store.load("ghost").is_none());
    }

    #[test]
    fn delete_keeps_logs() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save("inst1", &json!({})).unwrap();
        store.save_pid("inst1", std::process::id() as i32).unwrap();
        std::fs::write(store.log_file("inst1", "out"), "hello").unwrap();

        store.delete("inst1").unwrap();

        assert!(store.load("inst1").is_none());
        assert!(store.log_file("inst1", "out").exists());
    }

    #[test]
    fn exists_self_heals_dead_pid() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());
        store.save("ghost", &json!({})).unwrap();
        store.save_pid("ghost", 999_999).unwrap();

        assert!(!store.exists("ghost"));
        assert!(store.load("ghost").is_none());
    }

    #[test]
    fn list_only_returns_live_instances() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path());

        store.save("alive", &json!({})).unwrap();
        store.save_pid("alive", std::process::id() as i32).unwrap();

        store.save("dead", &json!({})).unwrap();
        store.save_pid("dead", 999_999).unwrap();

        let listed = store.list();
        assert_eq!(listed, vec!["alive".to_string()]);
    }
}
