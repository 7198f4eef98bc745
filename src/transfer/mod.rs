//! Resumable chunked transfer engine
//!
//! Partitions a file into fixed-size chunks, transfers them with one of
//! three worker strategies (serial/parallel/aria2), persists a manifest
//! after every chunk so an interrupted transfer may resume, and verifies
//! size/hash on completion (§4.4, §4.5).

mod chunk;
mod endpoint;
mod engine;
mod manifest;
mod service;

pub use chunk::{Chunk, ChunkScheduler, ChunkStatus};
pub use endpoint::{generate_manifest_key, parse_scp_path, resolve_remote_path, Endpoint};
pub use engine::{write_chunks_to_file, Aria2Strategy, ParallelStrategy, SerialStrategy, TransferStrategy};
pub use manifest::{mark_verified, validate_manifest, Manifest, ManifestStore};
pub use service::{ProgressCallback, RemoteAuth, TransferService};
