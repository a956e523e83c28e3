//! Tidal Cluster - Cluster-facing capabilities
//!
//! Provides:
//! - The master (directory) client interface
//! - The block transport interface and managed block buffers
//! - Topology mapping for rack-aware placement
//! - TTL-cached peer lists
//! - Pluggable block replication policies

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod master;
pub mod peers;
pub mod replication;
pub mod topology;
pub mod transport;

pub use master::{BlockLocationsAndStatus, MasterClient};
pub use peers::PeerCache;
pub use replication::{
    create_policy, BlockReplicationPolicy, RandomReplicationPolicy, TopologyAwareReplicationPolicy,
};
pub use topology::{FlatTopologyMapper, StaticTopologyMapper, TopologyMapper};
pub use transport::{BlockData, BlockTransport, DownloadFileManager, ExternalShuffleClient};
