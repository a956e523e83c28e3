//! Shuffle block serving seam
//!
//! Shuffle files are written by the shuffle subsystem, not through the
//! block manager's put path, so reads bypass the lock manager entirely and
//! go straight to the resolver.

use tidal_cluster::transport::BlockData;
use tidal_common::error::Result;
use tidal_common::types::BlockId;

/// Resolves shuffle block ids to their bytes on local disk
pub trait ShuffleBlockResolver: Send + Sync {
    fn get_block_data(&self, block: &BlockId) -> Result<BlockData>;
}
