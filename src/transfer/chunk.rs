//! Chunk scheduling
//!
//! Computes chunk layout from a file size and [`TransferConfig`], with the
//! aria2 redistribution formula and small-file collapse from §4.4.

use crate::config::TransferConfig;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    Pending,
    Downloading,
    Completed,
    Verified,
    Failed,
}

/// A contiguous byte range of a file transferred as one unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub offset: u64,
    pub size: u64,
    pub status: ChunkStatus,
    pub attempts: u32,
    pub downloaded_bytes: u64,
    pub sha1: Option<String>,
    pub sha256: Option<String>,
}

impl Chunk {
    fn new(index: usize, offset: u64, size: u64) -> Self {
        Self {
            index,
            offset,
            size,
            status: ChunkStatus::Pending,
            attempts: 0,
            downloaded_bytes: 0,
            sha1: None,
            sha256: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.status, ChunkStatus::Completed | ChunkStatus::Verified)
    }

    pub fn should_retry(&self, max_retries: u32) -> bool {
        self.status == ChunkStatus::Failed && self.attempts < max_retries
    }
}

/// Computes chunk layout from `(file_size, config)` — never mutates chunks,
/// only classifies them.
pub struct ChunkScheduler<'a> {
    config: &'a TransferConfig,
}

impl<'a> ChunkScheduler<'a> {
    pub fn new(config: &'a TransferConfig) -> Self {
        Self { config }
    }

    /// Builds the chunk list for `file_size` (§4.4).
    pub fn create_chunks(&self, file_size: u64) -> Vec<Chunk> {
        if file_size == 0 {
            return Vec::new();
        }

        let (mut chunk_size, mut num_chunks) = if self.config.aria2 {
            let chunk_size = std::cmp::max(self.config.chunk_min, self.config.chunk / 4);
            let n = std::cmp::min(
                self.config.split as u64,
                file_size.div_ceil(chunk_size),
            );
            let chunk_size = file_size.div_ceil(n);
            (chunk_size, n as usize)
        } else {
            let chunk_size = self.config.chunk;
            let n = file_size.div_ceil(chunk_size);
            (chunk_size, n as usize)
        };

        if file_size < chunk_size * 2 {
            num_chunks = 1;
            chunk_size = file_size;
        }

        let mut chunks = Vec::with_capacity(num_chunks);
        let mut offset = 0u64;
        for i in 0..num_chunks {
            let size = std::cmp::min(chunk_size, file_size - offset);
            if size == 0 {
                break;
            }
            chunks.push(Chunk::new(i, offset, size));
            offset += size;
        }

        chunks
    }

    pub fn get_pending_chunks(chunks: &[Chunk]) -> Vec<usize> {
        chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.is_complete())
            .map(|(i, _)| i)
            .collect()
    }

    pub fn get_failed_chunks(chunks: &[Chunk]) -> Vec<usize> {
        chunks
            .iter()
            .enumerate()
            .filter(|(_, c)| c.status == ChunkStatus::Failed)
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> TransferConfig {
        TransferConfig {
            chunk: 4 * 1024 * 1024,
            chunk_min: 1024 * 1024,
            ..TransferConfig::default()
        }
    }

    #[test]
    fn coverage_is_contiguous_and_disjoint() {
        let config = cfg();
        let scheduler = ChunkScheduler::new(&config);
        let file_size = 10 * 1024 * 1024 + 123;
        let chunks = scheduler.create_chunks(file_size);

        let total: u64 = chunks.iter().map(|c| c.size).sum();
        assert_eq!(total, file_size);

        let mut expected_offset = 0u64;
        for c in &chunks {
            assert_eq!(c.offset, expected_offset);
            expected_offset += c.size;
        }
    }

    #[test]
    fn small_file_collapses_to_one_chunk() {
        let config = cfg();
        let scheduler = ChunkScheduler::new(&config);
        let chunks = scheduler.create_chunks(1024);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].size, 1024);
    }

    #[test]
    fn aria2_redistributes_evenly() {
        let mut config = cfg();
        config.aria2 = true;
        config.split = 32;
        let scheduler = ChunkScheduler::new(&config);
        let file_size = 64 * 1024 * 1024;
        let chunks = scheduler.create_chunks(file_size);

        assert_eq!(chunks.len(), 32);
        let total: u64 = chunks.iter().map(|c| c.size).sum();
        assert_eq!(total, file_size);
        // each chunk should be close to file_size/32
        for c in &chunks {
            assert!(c.size <= 2 * 1024 * 1024 + 1);
        }
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let config = cfg();
        let scheduler = ChunkScheduler::new(&config);
        assert!(scheduler.create_chunks(0).is_empty());
    }

    #[test]
    fn pending_and_failed_classification() {
        let config = cfg();
        let scheduler = ChunkScheduler::new(&config);
        let mut chunks = scheduler.create_chunks(10 * 1024 * 1024);
        chunks[0].status = ChunkStatus::Verified;
        chunks[1].status = ChunkStatus::Failed;

        let pending = ChunkScheduler::get_pending_chunks(&chunks);
        assert!(!pending.contains(&0));
        assert!(pending.contains(&1));

        let failed = ChunkScheduler::get_failed_chunks(&chunks);
        assert_eq!(failed, vec![1]);
    }
}
