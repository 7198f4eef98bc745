//! Transfer service orchestration (§4.5)
//!
//! Ties together endpoint parsing, manifest load/validate/reuse, chunk
//! scheduling, the three worker strategies, and post-transfer verification
//! into the single `transfer()` entry point the CLI calls.

use crate::config::{ConnectionParams, TransferConfig};
use crate::error::{RemoteError, Result};
use crate::ssh::SshClient;
use crate::transfer::chunk::{Chunk, ChunkScheduler, ChunkStatus};
use crate::transfer::endpoint::{generate_manifest_key, parse_scp_path, resolve_remote_path, Endpoint};
use crate::transfer::engine::{write_chunks_to_file, Aria2Strategy, ParallelStrategy, SerialStrategy, TransferStrategy};
use crate::transfer::manifest::{mark_verified, validate_manifest, Manifest, ManifestStore};
use sha2::{Digest, Sha256};
use ssh2::{OpenFlags, OpenType};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Progress callback: cumulative bytes transferred, total bytes (§4.5 step
/// 14). Must be `Sync` because worker-pool strategies call it from
/// multiple threads.
pub type ProgressCallback<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);

/// Optional remote-side credentials the caller supplies for whichever
/// endpoint turns out to be remote (topology is only known after parsing).
#[derive(Debug, Clone, Default)]
pub struct RemoteAuth {
    pub password: Option<String>,
    pub key_path: Option<PathBuf>,
    pub timeout: u64,
}

/// Pure business logic for chunked resumable transfer. No CLI/TOML/progress
/// bar dependency — callers own presentation.
pub struct TransferService {
    manifest_store: ManifestStore,
}

impl TransferService {
    pub fn new(manifest_store: ManifestStore) -> Self {
        Self { manifest_store }
    }

    pub fn with_default_store() -> Self {
        Self::new(ManifestStore::default_store())
    }

    /// Transfers `src_path` to `dst_path`. Exactly one of the two must be
    /// local (§4.5 step 1). Returns `(bytes_transferred, total_bytes)`.
    pub fn transfer(
        &self,
        src_path: &str,
        dst_path: &str,
        config: &TransferConfig,
        auth: &RemoteAuth,
        progress: Option<ProgressCallback>,
    ) -> Result<(u64, u64)> {
        config.validate()?;

        let mut src = parse_scp_path(src_path, config.ssh_port)?;
        let mut dst = parse_scp_path(dst_path, config.ssh_port)?;

        let is_download = !src.is_local && dst.is_local;
        let is_upload = src.is_local && !dst.is_local;
        if !is_download && !is_upload {
            return Err(RemoteError::TransferError(
                "only local<->remote transfers are supported (invalid topology)".into(),
            ));
        }

        let mut remote_client = if is_download {
            Some(connect_for(&src, config, auth)?)
        } else {
            Some(connect_for(&dst, config, auth)?)
        };

        let result = self.run_transfer(&mut src, &mut dst, is_download, config, remote_client.as_mut(), progress);

        if let Some(client) = remote_client.take() {
            drop(client);
        }

        result
    }

    fn run_transfer(
        &self,
        src: &mut Endpoint,
        dst: &mut Endpoint,
        is_download: bool,
        config: &TransferConfig,
        client: Option<&mut SshClient>,
        progress: Option<ProgressCallback>,
    ) -> Result<(u64, u64)> {
        let client = client.expect("remote client established for the non-local endpoint");

        if is_download {
            src.path = resolve_remote_path(client, src)?;
        } else {
            dst.path = resolve_remote_path(client, dst)?;
        }

        let (file_size, file_mtime) = if is_download {
            stat_remote(client, &src.path)?
        } else {
            stat_local(&src.path)?
        };
        if file_size == 0 {
            return Err(RemoteError::TransferError(format!("source file is empty: {}", src.path)));
        }

        let manifest_key = generate_manifest_key(src, dst);
        let scheduler = ChunkScheduler::new(config);

        let mut manifest = self.load_or_create_manifest(&manifest_key, src, dst, file_size, file_mtime, config, &scheduler)?;

        let total_bytes: u64 = manifest.chunks.iter().map(|c| c.size).sum();
        if config.force {
            for c in &mut manifest.chunks {
                c.status = ChunkStatus::Pending;
            }
        }

        let initial_transferred: u64 = manifest
            .chunks
            .iter()
            .filter(|c| c.is_complete())
            .map(|c| c.size)
            .sum();
        if initial_transferred > 0 {
            if let Some(cb) = progress {
                cb(initial_transferred, total_bytes);
            }
        }

        let pending_indices: Vec<usize> = if config.force {
            (0..manifest.chunks.len()).collect()
        } else {
            ChunkScheduler::get_pending_chunks(&manifest.chunks)
        };

        if pending_indices.is_empty() {
            info!(key = %manifest_key, "all chunks already transferred, verifying only");
            self.finish(&manifest_key, &mut manifest, src, dst, is_download, client)?;
            if let Some(cb) = progress {
                cb(total_bytes, total_bytes);
            }
            return Ok((total_bytes, total_bytes));
        }

        let pending_chunks: Vec<Chunk> = pending_indices.iter().map(|&i| manifest.chunks[i].clone()).collect();

        if is_download {
            self.download(client, &src.path, &dst.path, &pending_chunks, config, initial_transferred, total_bytes, progress)?;
        } else {
            self.upload(client, &src.path, &dst.path, &pending_chunks, config, initial_transferred, total_bytes, progress)?;
        }

        for chunk in &pending_chunks {
            manifest.chunks[chunk.index].status = ChunkStatus::Completed;
        }

        self.finish(&manifest_key, &mut manifest, src, dst, is_download, client)?;

        let final_transferred: u64 = manifest.chunks.iter().filter(|c| c.is_complete()).map(|c| c.size).sum();
        Ok((final_transferred, total_bytes))
    }

    fn load_or_create_manifest(
        &self,
        key: &str,
        src: &Endpoint,
        dst: &Endpoint,
        file_size: u64,
        file_mtime: f64,
        config: &TransferConfig,
        scheduler: &ChunkScheduler,
    ) -> Result<Manifest> {
        if !config.force {
            if let Some(manifest) = self.manifest_store.load(key)? {
                if validate_manifest(&manifest, src, dst, file_size, file_mtime) {
                    let mut manifest = manifest;
                    let total: u64 = manifest.chunks.iter().map(|c| c.size).sum();
                    if manifest.chunks.is_empty() || total != file_size {
                        warn!(key, "manifest chunk layout stale, rescheduling");
                        manifest.chunks = scheduler.create_chunks(file_size);
                    } else {
                        debug!(key, "resuming transfer from manifest");
                    }
                    return Ok(manifest);
                }
                warn!(key, "manifest validation failed, starting fresh");
            }
        }

        let mut manifest = Manifest::new(src.clone(), dst.clone(), file_size, file_mtime, config.clone());
        manifest.chunks = scheduler.create_chunks(file_size);
        Ok(manifest)
    }

    fn download(
        &self,
        client: &SshClient,
        remote_path: &str,
        local_path: &str,
        chunks: &[Chunk],
        config: &TransferConfig,
        initial_transferred: u64,
        total_bytes: u64,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let transferred = AtomicU64::new(initial_transferred);
        let max_retries = config.max_retries;
        let limit_rate = config.limit_rate;

        let op = |chunk: &Chunk| -> Result<Vec<u8>> {
            retrying(max_retries, || download_one_chunk(client, remote_path, chunk, limit_rate))
        };

        let results = dispatch(config, chunks, op);

        let mut data = Vec::with_capacity(results.len());
        let mut failed = Vec::new();
        for (index, result) in results {
            match result {
                Ok(bytes) => {
                    let total_so_far = transferred.fetch_add(bytes.len() as u64, Ordering::SeqCst) + bytes.len() as u64;
                    if let Some(cb) = progress {
                        cb(total_so_far, total_bytes);
                    }
                    data.push((index, bytes));
                }
                Err(e) => {
                    warn!(index, error = %e, "chunk download failed permanently");
                    failed.push(index);
                }
            }
        }

        if !failed.is_empty() {
            return Err(RemoteError::TransferError(format!("failed to download chunks: {:?}", failed)));
        }

        write_chunks_to_file(Path::new(local_path), chunks, &data)
    }

    fn upload(
        &self,
        client: &SshClient,
        local_path: &str,
        remote_path: &str,
        chunks: &[Chunk],
        config: &TransferConfig,
        initial_transferred: u64,
        total_bytes: u64,
        progress: Option<ProgressCallback>,
    ) -> Result<()> {
        let sftp = client.open_fresh_sftp()?;
        let parent = Path::new(remote_path).parent().unwrap_or_else(|| Path::new("/"));
        client.create_remote_dir_all(&sftp, parent)?;
        ensure_remote_file_size(&sftp, remote_path, total_bytes)?;

        let transferred = AtomicU64::new(initial_transferred);
        let max_retries = config.max_retries;
        let limit_rate = config.limit_rate;

        let op = |chunk: &Chunk| -> Result<()> {
            retrying(max_retries, || upload_one_chunk(client, local_path, remote_path, chunk, limit_rate))
        };

        let results = dispatch(config, chunks, op);

        let mut failed = Vec::new();
        for (index, result) in results {
            match result {
                Ok(()) => {
                    let size = chunks.iter().find(|c| c.index == index).map(|c| c.size).unwrap_or(0);
                    let total_so_far = transferred.fetch_add(size, Ordering::SeqCst) + size;
                    if let Some(cb) = progress {
                        cb(total_so_far, total_bytes);
                    }
                }
                Err(e) => {
                    warn!(index, error = %e, "chunk upload failed permanently");
                    failed.push(index);
                }
            }
        }

        if !failed.is_empty() {
            return Err(RemoteError::TransferError(format!("failed to upload chunks: {:?}", failed)));
        }

        Ok(())
    }

    fn finish(
        &self,
        key: &str,
        manifest: &mut Manifest,
        src: &Endpoint,
        dst: &Endpoint,
        is_download: bool,
        client: &SshClient,
    ) -> Result<()> {
        self.verify(src, dst, &mut manifest.chunks, is_download, client)?;
        manifest.touch();
        self.manifest_store.save(key, manifest)?;
        info!(key, "transfer completed successfully");
        Ok(())
    }

    /// Post-transfer verification (§4.5 step 15): size check plus a logged,
    /// unenforced SHA-256 for downloads (§9a — per-chunk SHA-1 fields are
    /// likewise computed but never checked).
    fn verify(&self, src: &Endpoint, dst: &Endpoint, chunks: &mut [Chunk], is_download: bool, client: &SshClient) -> Result<()> {
        let expected: u64 = chunks.iter().map(|c| c.size).sum();

        if is_download {
            let local_path = Path::new(&dst.path);
            let metadata = std::fs::metadata(local_path).map_err(|e| RemoteError::io(local_path, e))?;
            if metadata.len() != expected {
                return Err(RemoteError::TransferError(format!(
                    "file size mismatch: expected {}, got {}",
                    expected,
                    metadata.len()
                )));
            }
            if let Ok(hash) = compute_file_sha256(local_path) {
                debug!(file = %dst.path, sha256 = %hash, "download hash computed (not enforced)");
            }
        } else {
            let sftp = client.open_fresh_sftp()?;
            let stat = sftp
                .stat(Path::new(&dst.path))
                .map_err(|e| RemoteError::TransferError(format!("failed to verify remote file: {}", e)))?;
            let actual = stat.size.unwrap_or(0);
            if actual != expected {
                return Err(RemoteError::TransferError(format!(
                    "remote file size mismatch: expected {}, got {}",
                    expected, actual
                )));
            }
        }

        mark_verified(chunks);
        Ok(())
    }
}

fn dispatch<T, F>(config: &TransferConfig, chunks: &[Chunk], op: F) -> Vec<(usize, Result<T>)>
where
    T: Send + 'static,
    F: Fn(&Chunk) -> Result<T> + Send + Sync,
{
    if config.aria2 {
        Aria2Strategy { parallel: config.parallel }.run(chunks, op)
    } else if config.parallel > 1 {
        ParallelStrategy { workers: config.parallel }.run(chunks, op)
    } else {
        SerialStrategy.run(chunks, op)
    }
}

fn retrying<T>(max_retries: u32, mut attempt: impl FnMut() -> Result<T>) -> Result<T> {
    let mut tries = 0;
    loop {
        match attempt() {
            Ok(v) => return Ok(v),
            Err(e) if tries < max_retries => tries += 1,
            Err(e) => return Err(e),
        }
    }
}

fn download_one_chunk(client: &SshClient, remote_path: &str, chunk: &Chunk, limit_rate: Option<u64>) -> Result<Vec<u8>> {
    use std::io::{Read, Seek, SeekFrom};

    let sftp = client.open_fresh_sftp()?;
    let mut file = sftp
        .open(Path::new(remote_path))
        .map_err(|e| RemoteError::TransferError(format!("chunk {}: open failed: {}", chunk.index, e)))?;
    file.seek(SeekFrom::Start(chunk.offset))
        .map_err(|e| RemoteError::TransferError(format!("chunk {}: seek failed: {}", chunk.index, e)))?;

    let mut buf = vec![0u8; chunk.size as usize];
    file.read_exact(&mut buf)
        .map_err(|e| RemoteError::TransferError(format!("chunk {}: read failed: {}", chunk.index, e)))?;

    apply_rate_limit(buf.len() as u64, limit_rate);
    Ok(buf)
}

fn upload_one_chunk(client: &SshClient, local_path: &str, remote_path: &str, chunk: &Chunk, limit_rate: Option<u64>) -> Result<()> {
    use std::io::{Read, Seek, SeekFrom, Write};

    let mut local_file = std::fs::File::open(local_path).map_err(|e| RemoteError::io(local_path, e))?;
    local_file
        .seek(SeekFrom::Start(chunk.offset))
        .map_err(|e| RemoteError::io(local_path, e))?;
    let mut buf = vec![0u8; chunk.size as usize];
    local_file
        .read_exact(&mut buf)
        .map_err(|e| RemoteError::io(local_path, e))?;

    let sftp = client.open_fresh_sftp()?;
    let mut remote_file = sftp
        .open_mode(Path::new(remote_path), OpenFlags::WRITE, 0o644, OpenType::File)
        .map_err(|e| RemoteError::TransferError(format!("chunk {}: remote open failed: {}", chunk.index, e)))?;
    remote_file
        .seek(SeekFrom::Start(chunk.offset))
        .map_err(|e| RemoteError::TransferError(format!("chunk {}: remote seek failed: {}", chunk.index, e)))?;
    remote_file
        .write_all(&buf)
        .map_err(|e| RemoteError::TransferError(format!("chunk {}: remote write failed: {}", chunk.index, e)))?;

    apply_rate_limit(buf.len() as u64, limit_rate);
    Ok(())
}

/// Per-chunk rate limiting (§4.5 step 13, §9c): sleep `bytes / limit_rate`
/// seconds after each completed chunk, never mid-write.
fn apply_rate_limit(bytes: u64, limit_rate: Option<u64>) {
    if let Some(rate) = limit_rate {
        if rate > 0 {
            std::thread::sleep(std::time::Duration::from_secs_f64(bytes as f64 / rate as f64));
        }
    }
}

fn ensure_remote_file_size(sftp: &ssh2::Sftp, remote_path: &str, size: u64) -> Result<()> {
    let path = Path::new(remote_path);
    match sftp.stat(path) {
        Ok(stat) if stat.size == Some(size) => Ok(()),
        _ => {
            let mut file = sftp
                .open_mode(path, OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE, 0o644, OpenType::File)
                .map_err(|e| RemoteError::TransferError(format!("failed to create remote file: {}", e)))?;
            file.setstat(ssh2::FileStat {
                size: Some(size),
                uid: None,
                gid: None,
                perm: None,
                atime: None,
                mtime: None,
            })
            .map_err(|e| RemoteError::TransferError(format!("failed to pre-allocate remote file: {}", e)))?;
            Ok(())
        }
    }
}

fn stat_local(path: &str) -> Result<(u64, f64)> {
    let metadata = std::fs::metadata(path).map_err(|e| RemoteError::io(path, e))?;
    let mtime = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    Ok((metadata.len(), mtime))
}

fn stat_remote(client: &SshClient, path: &str) -> Result<(u64, f64)> {
    let sftp = client.open_fresh_sftp()?;
    let stat = sftp
        .stat(Path::new(path))
        .map_err(|e| RemoteError::TransferError(format!("failed to stat remote file {}: {}", path, e)))?;
    Ok((stat.size.unwrap_or(0), stat.mtime.unwrap_or(0) as f64))
}

fn compute_file_sha256(path: &Path) -> Result<String> {
    use std::io::Read;
    let mut file = std::fs::File::open(path).map_err(|e| RemoteError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 65536];
    loop {
        let n = file.read(&mut buf).map_err(|e| RemoteError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn connect_for(endpoint: &Endpoint, config: &TransferConfig, auth: &RemoteAuth) -> Result<SshClient> {
    let host = endpoint.host.clone().ok_or_else(|| RemoteError::TransferError("missing remote host".into()))?;
    let user = endpoint.user.clone().unwrap_or_else(|| "root".to_string());

    let mut params = ConnectionParams::new(host, user).with_port(endpoint.port);
    params.timeout = if auth.timeout > 0 { auth.timeout } else { config.timeout };

    if let Some(key) = endpoint.key_file.clone().or_else(|| auth.key_path.clone()) {
        params = params.with_key(key);
    }
    if let Some(password) = &auth.password {
        params = params.with_password(password.clone());
    }

    SshClient::connect(&params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::chunk::ChunkScheduler;
    use tempfile::tempdir;

    #[test]
    fn dispatch_picks_serial_for_single_worker() {
        let config = TransferConfig { parallel: 1, aria2: false, ..TransferConfig::default() };
        let scheduler = ChunkScheduler::new(&config);
        let chunks = scheduler.create_chunks(8);
        let results = dispatch(&config, &chunks, |c| Ok::<_, RemoteError>(c.index));
        assert_eq!(results.len(), chunks.len());
    }

    #[test]
    fn write_then_verify_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f.bin");
        std::fs::write(&path, b"hello world").unwrap();
        let hash1 = compute_file_sha256(&path).unwrap();
        let hash2 = compute_file_sha256(&path).unwrap();
        assert_eq!(hash1, hash2);
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn retrying_gives_up_after_max() {
        let mut calls = 0;
        let result: Result<()> = retrying(2, || {
            calls += 1;
            Err(RemoteError::TransferError("nope".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 3);
    }

    #[test]
    fn retrying_succeeds_eventually() {
        let mut calls = 0;
        let result = retrying(5, || {
            calls += 1;
            if calls < 3 {
                Err(RemoteError::TransferError("nope".into()))
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
    }
}
