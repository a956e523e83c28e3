//! Block transport interface and managed block buffers
//!
//! The on-wire transfer service is outside this subsystem; uploads and
//! fetches go through this capability.

use std::path::PathBuf;

use bytes::Bytes;

use tidal_common::error::{Error, Result};
use tidal_common::types::{BlockId, BlockManagerId, StorageLevel};

/// A block's bytes, either resident in memory or backed by a local file.
/// The file-backed form is produced when a fetch was too large to hold in
/// memory and the transport spilled it through a [`DownloadFileManager`].
#[derive(Debug, Clone)]
pub enum BlockData {
    Bytes(Bytes),
    File { path: PathBuf, size: u64 },
}

impl BlockData {
    /// Size of the block in bytes
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            BlockData::Bytes(bytes) => bytes.len() as u64,
            BlockData::File { size, .. } => *size,
        }
    }

    /// Materialize the full contents in memory. For file-backed data this
    /// reads the whole file.
    pub fn into_bytes(self) -> Result<Bytes> {
        match self {
            BlockData::Bytes(bytes) => Ok(bytes),
            BlockData::File { path, .. } => {
                let contents = std::fs::read(&path).map_err(Error::Io)?;
                Ok(Bytes::from(contents))
            }
        }
    }
}

impl From<Bytes> for BlockData {
    fn from(bytes: Bytes) -> Self {
        BlockData::Bytes(bytes)
    }
}

/// Capability handed to the transport so an oversize fetch can spill to a
/// local temp file whose lifetime is coupled to the in-memory consumer.
pub trait DownloadFileManager: Send + Sync {
    /// Allocate a fresh file to absorb one fetch
    fn create_temp_file(&self) -> PathBuf;

    /// Couple the file's lifetime to its consumer. Returns `false` when the
    /// manager has stopped, in which case the caller owns the deletion.
    fn register_temp_file_to_clean(&self, path: PathBuf) -> bool;
}

/// Synchronous block transfer capability
pub trait BlockTransport: Send + Sync {
    /// Fetch one block from a remote node. When `temp_file_manager` is
    /// given, the transport may return file-backed data instead of holding
    /// the bytes in memory.
    fn fetch_block_sync(
        &self,
        host: &str,
        port: u16,
        executor_id: &str,
        block: &BlockId,
        temp_file_manager: Option<&dyn DownloadFileManager>,
    ) -> Result<BlockData>;

    /// Upload one block to a remote node, which stores it at the given level
    /// (with replication already stripped to 1).
    fn upload_block_sync(
        &self,
        peer: &BlockManagerId,
        block: &BlockId,
        data: &BlockData,
        level: StorageLevel,
        type_tag: &str,
    ) -> Result<()>;
}

/// Client for an external shuffle service colocated on each host. When
/// enabled, shuffle files outlive the executor and registration tells the
/// service where they are.
pub trait ExternalShuffleClient: Send + Sync {
    fn register_with_shuffle_server(
        &self,
        host: &str,
        port: u16,
        executor_id: &str,
        local_dirs: &[String],
        sub_dirs_per_local_dir: u32,
    ) -> Result<()>;
}
