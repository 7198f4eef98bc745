//! Transfer manifest and its on-disk store
//!
//! A manifest records enough state to resume an interrupted transfer:
//! endpoints, chunk layout/status, and timestamps. Keyed by SHA-256 of the
//! normalized `src|dst` endpoint pair (see
//! [`generate_manifest_key`](crate::transfer::endpoint::generate_manifest_key)).

use super::chunk::{Chunk, ChunkStatus};
use super::endpoint::Endpoint;
use crate::config::TransferConfig;
use crate::error::{RemoteError, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub src: Endpoint,
    pub dst: Endpoint,
    pub size: u64,
    pub mtime: f64,
    pub chunks: Vec<Chunk>,
    pub transfer_config: TransferConfig,
    pub created_at: f64,
    pub updated_at: f64,
}

impl Manifest {
    pub fn new(src: Endpoint, dst: Endpoint, size: u64, mtime: f64, config: TransferConfig) -> Self {
        let now = Utc::now().timestamp() as f64;
        Self {
            version: "1.0".to_string(),
            src,
            dst,
            size,
            mtime,
            chunks: Vec::new(),
            transfer_config: config,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.chunks.is_empty() && self.chunks.iter().all(|c| c.is_complete())
    }

    pub fn completed_bytes(&self) -> u64 {
        self.chunks.iter().filter(|c| c.is_complete()).map(|c| c.size).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.size).sum()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now().timestamp() as f64;
    }
}

/// Validates a loaded manifest against the current source file's actual
/// `(size, mtime)` (§3, §4.5 step 6). `|manifest.mtime - mtime| <= 1.0`
/// tolerates filesystem timestamp precision differences.
pub fn validate_manifest(manifest: &Manifest, src: &Endpoint, dst: &Endpoint, size: u64, mtime: f64) -> bool {
    if manifest.src.path != src.path || manifest.dst.path != dst.path {
        return false;
    }
    if manifest.size != size {
        return false;
    }
    (manifest.mtime - mtime).abs() <= 1.0
}

/// Keyed JSON manifest store, one file per transfer (§4.2 companion for
/// transfers; unlike [`crate::state::FileStateStore`] there is no PID/
/// liveness concept here — existence is a plain file check).
pub struct ManifestStore {
    dir: PathBuf,
}

impl ManifestStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_store() -> Self {
        let home = std::env::var_os("HOME").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("."));
        Self::new(home.join(".remote").join("state").join("transfer"))
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }

    pub fn save(&self, key: &str, manifest: &Manifest) -> Result<()> {
        std::fs::create_dir_all(&self.dir).map_err(|e| RemoteError::io(&self.dir, e))?;
        let path = self.path_for(key);
        let contents = serde_json::to_string_pretty(manifest)?;
        std::fs::write(&path, contents).map_err(|e| RemoteError::io(&path, e))
    }

    /// Unlike [`crate::state::FileStateStore::load`], a corrupt manifest is
    /// surfaced as an error rather than swallowed — losing resume state
    /// silently would be worse than failing loudly.
    pub fn load(&self, key: &str) -> Result<Option<Manifest>> {
        let path = self.path_for(key);
        if !path.exists() {
            return Ok(None);
        }
        let contents = std::fs::read_to_string(&path).map_err(|e| RemoteError::io(&path, e))?;
        let manifest: Manifest = serde_json::from_str(&contents)
            .map_err(|e| RemoteError::TransferError(format!("corrupt manifest {}: {}", key, e)))?;
        Ok(Some(manifest))
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| RemoteError::io(&path, e))?;
        }
        Ok(())
    }

    pub fn exists(&self, key: &str) -> bool {
        self.path_for(key).exists()
    }
}

/// Marks all `Completed` chunks as `Verified` in place.
pub fn mark_verified(chunks: &mut [Chunk]) {
    for chunk in chunks {
        if chunk.status == ChunkStatus::Completed {
            chunk.status = ChunkStatus::Verified;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::endpoint::Endpoint;
    use tempfile::tempdir;

    fn sample_manifest() -> Manifest {
        Manifest::new(
            Endpoint::local("/tmp/src"),
            Endpoint::local("/tmp/dst"),
            1024,
            1000.0,
            TransferConfig::default(),
        )
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        let manifest = sample_manifest();
        store.save("key1", &manifest).unwrap();

        let loaded = store.load("key1").unwrap().unwrap();
        assert_eq!(loaded.size, 1024);
        assert_eq!(loaded.src.path, "/tmp/src");
    }

    #[test]
    fn load_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = ManifestStore::new(dir.path());
        assert!(store.load("ghost").unwrap().is_none());
    }

    #[test]
    fn load_corrupt_is_error() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("bad.json"), "{not json").unwrap();
        let store = ManifestStore::new(dir.path());
        assert!(store.load("bad").is_err());
    }

    #[test]
    fn validation_rejects_size_mismatch() {
        let manifest = sample_manifest();
        let src = Endpoint::local("/tmp/src");
        let dst = Endpoint::local("/tmp/dst");
        assert!(!validate_manifest(&manifest, &src, &dst, 2048, 1000.0));
    }

    #[test]
    fn validation_tolerates_one_second_mtime_drift() {
        let manifest = sample_manifest();
        let src = Endpoint::local("/tmp/src");
        let dst = Endpoint::local("/tmp/dst");
        assert!(validate_manifest(&manifest, &src, &dst, 1024, 1000.9));
        assert!(!validate_manifest(&manifest, &src, &dst, 1024, 1002.1));
    }
}
