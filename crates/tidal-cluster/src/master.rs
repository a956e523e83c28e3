//! Client interface to the driver-side block directory ("master")
//!
//! The directory itself runs on the driver and is outside this subsystem;
//! every node talks to it through this capability.

use serde::{Deserialize, Serialize};

use tidal_common::error::Result;
use tidal_common::types::{BlockId, BlockManagerId, BlockStatus, StorageLevel};

/// The locations holding a block, together with its last reported status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockLocationsAndStatus {
    pub locations: Vec<BlockManagerId>,
    pub status: BlockStatus,
}

/// Directory service capability.
///
/// All operations are synchronous RPCs; transport failures surface as
/// `ClusterError`/`NetworkError` and are handled by the caller's retry
/// policy.
pub trait MasterClient: Send + Sync {
    /// Register this node. The master may canonicalize the id (e.g. fill in
    /// the topology tag); the returned id is the one to use from then on.
    fn register_block_manager(
        &self,
        id: &BlockManagerId,
        max_on_heap_bytes: u64,
        max_off_heap_bytes: u64,
        endpoint_name: &str,
    ) -> Result<BlockManagerId>;

    /// Report a block's current placement. A `false` reply means the master
    /// does not know the sender, which must then re-register.
    fn update_block_info(
        &self,
        id: &BlockManagerId,
        block: &BlockId,
        level: StorageLevel,
        mem_size: u64,
        disk_size: u64,
    ) -> Result<bool>;

    /// All locations currently holding a block
    fn get_locations(&self, block: &BlockId) -> Result<Vec<BlockManagerId>>;

    /// Locations plus last known status, or `None` if the block is unknown
    fn get_locations_and_status(&self, block: &BlockId)
        -> Result<Option<BlockLocationsAndStatus>>;

    /// Every other live block manager, excluding the caller and the driver
    fn get_peers(&self, id: &BlockManagerId) -> Result<Vec<BlockManagerId>>;
}
