//! Tidal Block - Per-node block storage engine
//!
//! Every node in a Tidal cluster runs one [`BlockManager`]. Together they
//! form a peer-to-peer overlay coordinated by the driver-side directory.
//! This crate provides:
//! - Per-block multi-reader/single-writer locking tracked by task
//! - A budgeted in-memory tier with spill-to-disk eviction
//! - A hashed on-disk tier
//! - Admission, placement and status reporting orchestration
//! - Peer replication with bounded retries
//! - Remote fetch with failure-driven location refresh

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod disk;
pub mod fetch;
pub mod info;
pub mod manager;
pub mod memory;
pub mod pool;
pub mod replicate;
pub mod shuffle;
pub mod tempfiles;
pub mod values;

pub use disk::{DiskBlockManager, DiskStore};
pub use fetch::{FetchedBlock, RemoteFetcher};
pub use info::{BlockInfo, BlockInfoManager};
pub use manager::{BlockManager, BlockManagerDirective, BlockResult, DataReadMethod};
pub use memory::{
    EvictionHandler, MemoryAccountant, MemoryEntry, MemoryStore, PartiallySerializedValues,
    PartiallyUnrolledIterator, SerializedUnrollOutcome, StaticMemoryAccountant, UnrollOutcome,
};
pub use pool::WorkerPool;
pub use replicate::Replicator;
pub use shuffle::ShuffleBlockResolver;
pub use tempfiles::{RemoteBlockTempFileManager, TempFileGuard};
pub use values::{BlockSerializer, BlockValue, EstimateSize, JsonSerializer};
