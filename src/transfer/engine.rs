//! Chunk transfer workers
//!
//! Three worker strategies dispatch over the same per-chunk operation
//! (§4.5 step 10): serial (one chunk at a time), parallel (a bounded pool of
//! `parallel` workers, each running a chunk to completion before picking the
//! next), and aria2 (a pool of `min(2·parallel, nChunks)` workers with
//! per-chunk retry/backoff and a second pass over anything still failed).
//!
//! Workers share a read-only chunk list and report one `(index, Result<T>)`
//! per chunk through a crossbeam channel; the caller assembles the final
//! file by offset, so wire order never matters (§5).

use crate::error::{RemoteError, Result};
use crate::transfer::chunk::Chunk;
use crossbeam::channel::bounded;
use std::path::Path;
use std::time::Duration;

/// A strategy distributes `chunks` over some number of workers, calling
/// `op` once per chunk and collecting `(index, Result<T>)` pairs. `op` must
/// be safe to call concurrently from multiple threads — it is expected to
/// open its own SFTP handle per call site (§5, §9d) rather than share one.
pub trait TransferStrategy {
    fn run<T, F>(&self, chunks: &[Chunk], op: F) -> Vec<(usize, Result<T>)>
    where
        T: Send + 'static,
        F: Fn(&Chunk) -> Result<T> + Send + Sync;
}

/// `parallel == 1 and not aria2`: a single loop, no thread pool.
pub struct SerialStrategy;

impl TransferStrategy for SerialStrategy {
    fn run<T, F>(&self, chunks: &[Chunk], op: F) -> Vec<(usize, Result<T>)>
    where
        T: Send + 'static,
        F: Fn(&Chunk) -> Result<T> + Send + Sync,
    {
        chunks.iter().map(|c| (c.index, op(c))).collect()
    }
}

/// `parallel > 1`: a bounded worker pool of `parallel` concurrent workers.
/// Each worker picks a chunk off the shared queue and runs it to
/// completion before picking the next; completion order is irrelevant.
pub struct ParallelStrategy {
    pub workers: usize,
}

impl TransferStrategy for ParallelStrategy {
    fn run<T, F>(&self, chunks: &[Chunk], op: F) -> Vec<(usize, Result<T>)>
    where
        T: Send + 'static,
        F: Fn(&Chunk) -> Result<T> + Send + Sync,
    {
        run_pool(chunks, self.workers.max(1), &op)
    }
}

/// Worker pool of `min(2·parallel, nChunks)`; each chunk gets up to three
/// attempts with a `0.1·(attempt+1)` second sleep between them (hardcoded,
/// independent of `TransferConfig.max_retries`, matching the source), then
/// any chunk still failed after the first pass is reattempted once more in
/// a second pass (§4.5 step 10).
pub struct Aria2Strategy {
    pub parallel: usize,
}

const ARIA2_MAX_RETRIES: u32 = 3;

impl TransferStrategy for Aria2Strategy {
    fn run<T, F>(&self, chunks: &[Chunk], op: F) -> Vec<(usize, Result<T>)>
    where
        T: Send + 'static,
        F: Fn(&Chunk) -> Result<T> + Send + Sync,
    {
        let workers = std::cmp::min(self.parallel.max(1) * 2, chunks.len().max(1));
        let max_retries = ARIA2_MAX_RETRIES;

        let with_retry = |chunk: &Chunk| -> Result<T> {
            let mut attempt = 0;
            loop {
                match op(chunk) {
                    Ok(v) => return Ok(v),
                    Err(_) if attempt < max_retries => {
                        std::thread::sleep(Duration::from_secs_f64(0.1 * (attempt as f64 + 1.0)));
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let first_pass = run_pool(chunks, workers, &with_retry);

        let still_failed: Vec<&Chunk> = first_pass
            .iter()
            .filter(|(_, r)| r.is_err())
            .filter_map(|(idx, _)| chunks.iter().find(|c| c.index == *idx))
            .collect();

        if still_failed.is_empty() {
            return first_pass;
        }

        let retry_chunks: Vec<Chunk> = still_failed.into_iter().cloned().collect();
        let second_pass = run_pool(&retry_chunks, workers, &with_retry);

        let mut by_index: std::collections::HashMap<usize, Result<T>> = first_pass.into_iter().collect();
        for (idx, result) in second_pass {
            by_index.insert(idx, result);
        }

        let mut out: Vec<(usize, Result<T>)> = by_index.into_iter().collect();
        out.sort_by_key(|(idx, _)| *idx);
        out
    }
}

/// Runs `op` over `chunks` using `workers` scoped threads pulling from a
/// shared bounded channel.
fn run_pool<T, F>(chunks: &[Chunk], workers: usize, op: &F) -> Vec<(usize, Result<T>)>
where
    T: Send + 'static,
    F: Fn(&Chunk) -> Result<T> + Send + Sync,
{
    if chunks.is_empty() {
        return Vec::new();
    }

    let (task_tx, task_rx) = bounded::<&Chunk>(chunks.len());
    let (result_tx, result_rx) = bounded::<(usize, Result<T>)>(chunks.len());

    for chunk in chunks {
        task_tx.send(chunk).expect("bounded to chunks.len()");
    }
    drop(task_tx);

    crossbeam::thread::scope(|scope| {
        for _ in 0..workers {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            scope.spawn(move |_| {
                while let Ok(chunk) = task_rx.recv() {
                    let result = op(chunk);
                    let _ = result_tx.send((chunk.index, result));
                }
            });
        }
        drop(result_tx);
    })
    .expect("worker scope should not panic");

    result_rx.iter().collect()
}

/// Writes downloaded chunk data to `local_file` at each chunk's offset via a
/// temporary `.part` sibling, then atomically renames into place (§4.5 step
/// 11). Sparse-safe: chunks may be written in any order.
pub fn write_chunks_to_file(local_file: &Path, chunks: &[Chunk], chunk_data: &[(usize, Vec<u8>)]) -> Result<()> {
    if let Some(parent) = local_file.parent() {
        std::fs::create_dir_all(parent).map_err(|e| RemoteError::io(parent, e))?;
    }

    let temp_file = {
        let mut name = local_file.file_name().and_then(|n| n.to_str()).unwrap_or("transfer").to_string();
        name.push_str(".part");
        local_file.with_file_name(name)
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(&temp_file)
        .map_err(|e| RemoteError::io(&temp_file, e))?;

    use std::io::{Seek, SeekFrom, Write};
    let mut file = file;
    let by_index: std::collections::HashMap<usize, &Vec<u8>> =
        chunk_data.iter().map(|(i, d)| (*i, d)).collect();

    for chunk in chunks {
        let Some(data) = by_index.get(&chunk.index) else { continue };
        file.seek(SeekFrom::Start(chunk.offset)).map_err(|e| RemoteError::io(&temp_file, e))?;
        file.write_all(data).map_err(|e| RemoteError::io(&temp_file, e))?;
    }
    file.sync_all().map_err(|e| RemoteError::io(&temp_file, e))?;
    drop(file);

    std::fs::rename(&temp_file, local_file).map_err(|e| RemoteError::io(local_file, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::chunk::ChunkStatus;
    use tempfile::tempdir;

    fn chunk(index: usize, offset: u64, size: u64) -> Chunk {
        // Chunk has private constructor in chunk.rs; build via scheduler instead in real
        // tests, but for this pure engine-layer test we only need index/offset/size, so
        // round-trip through serde to avoid depending on a private field.
        let json = serde_json::json!({
            "index": index, "offset": offset, "size": size, "status": "pending",
            "attempts": 0, "downloaded_bytes": 0, "sha1": null, "sha256": null,
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn serial_strategy_preserves_all_chunks() {
        let chunks = vec![chunk(0, 0, 4), chunk(1, 4, 4)];
        let results = SerialStrategy.run(&chunks, |c| Ok::<_, RemoteError>(c.index));
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }

    #[test]
    fn parallel_strategy_runs_all_chunks() {
        let chunks: Vec<Chunk> = (0..10).map(|i| chunk(i, i as u64 * 4, 4)).collect();
        let strategy = ParallelStrategy { workers: 4 };
        let results = strategy.run(&chunks, |c| Ok::<_, RemoteError>(c.size));
        assert_eq!(results.len(), 10);
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }

    #[test]
    fn aria2_strategy_retries_then_recovers() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let chunks = vec![chunk(0, 0, 4), chunk(1, 4, 4)];
        let attempts = AtomicUsize::new(0);
        let strategy = Aria2Strategy { parallel: 2 };
        let results = strategy.run(&chunks, |c| {
            if c.index == 1 && attempts.fetch_add(1, Ordering::SeqCst) < 1 {
                Err(RemoteError::TransferError("flaky".into()))
            } else {
                Ok::<_, RemoteError>(c.index)
            }
        });
        assert!(results.iter().all(|(_, r)| r.is_ok()));
    }

    #[test]
    fn aria2_strategy_surfaces_permanent_failure() {
        let chunks = vec![chunk(0, 0, 4)];
        let strategy = Aria2Strategy { parallel: 1 };
        let results = strategy.run(&chunks, |_| Err::<usize, _>(RemoteError::TransferError("dead".into())));
        assert!(results[0].1.is_err());
    }

    #[test]
    fn write_chunks_to_file_assembles_by_offset() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out.bin");
        let chunks = vec![chunk(0, 0, 3), chunk(1, 3, 3)];
        let data = vec![(1usize, b"def".to_vec()), (0usize, b"abc".to_vec())];
        write_chunks_to_file(&path, &chunks, &data).unwrap();
        let contents = std::fs::read(&path).unwrap();
        assert_eq!(contents, b"abcdef");
    }

    #[test]
    fn chunk_status_default_round_trips() {
        let c = chunk(0, 0, 1);
        assert_eq!(c.status, ChunkStatus::Pending);
    }
}
