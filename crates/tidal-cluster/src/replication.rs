//! Pluggable peer prioritization for block replication

use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use tidal_common::error::{Error, Result};
use tidal_common::types::{BlockId, BlockManagerId};

/// Orders replication candidates and picks the ones to try, in order.
///
/// `peers` never contains the local node or a peer that already holds a
/// replica; `peers_replicated_to` is provided so a policy can score for
/// diversity against the copies already made.
pub trait BlockReplicationPolicy: Send + Sync {
    fn prioritize(
        &self,
        self_id: &BlockManagerId,
        peers: &[BlockManagerId],
        peers_replicated_to: &HashSet<BlockManagerId>,
        block: &BlockId,
        num_replicas: usize,
    ) -> Vec<BlockManagerId>;
}

/// Construct the policy named in configuration
pub fn create_policy(name: &str) -> Result<Arc<dyn BlockReplicationPolicy>> {
    match name {
        "random" => Ok(Arc::new(RandomReplicationPolicy)),
        "topology" => Ok(Arc::new(TopologyAwareReplicationPolicy)),
        other => Err(Error::Config(format!(
            "Unknown replication policy: {other}"
        ))),
    }
}

/// Seed derived from the block id, so repeated prioritization for the same
/// block walks candidates in a stable order across retries.
fn block_seed(block: &BlockId) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    block.hash(&mut hasher);
    hasher.finish()
}

/// Uniformly random prioritization
#[derive(Debug, Default)]
pub struct RandomReplicationPolicy;

impl BlockReplicationPolicy for RandomReplicationPolicy {
    fn prioritize(
        &self,
        _self_id: &BlockManagerId,
        peers: &[BlockManagerId],
        _peers_replicated_to: &HashSet<BlockManagerId>,
        block: &BlockId,
        num_replicas: usize,
    ) -> Vec<BlockManagerId> {
        let mut rng = StdRng::seed_from_u64(block_seed(block));
        let mut candidates: Vec<BlockManagerId> = peers.to_vec();
        candidates.shuffle(&mut rng);
        candidates.truncate(num_replicas);
        candidates
    }
}

/// Random prioritization that scores for rack diversity: when the replica
/// set so far (including the local node) lives on a single rack and an
/// off-rack candidate exists, one off-rack peer is tried first.
#[derive(Debug, Default)]
pub struct TopologyAwareReplicationPolicy;

impl BlockReplicationPolicy for TopologyAwareReplicationPolicy {
    fn prioritize(
        &self,
        self_id: &BlockManagerId,
        peers: &[BlockManagerId],
        peers_replicated_to: &HashSet<BlockManagerId>,
        block: &BlockId,
        num_replicas: usize,
    ) -> Vec<BlockManagerId> {
        let mut rng = StdRng::seed_from_u64(block_seed(block));

        let racks_covered: HashSet<&Option<String>> = std::iter::once(&self_id.topology_info)
            .chain(peers_replicated_to.iter().map(|p| &p.topology_info))
            .collect();

        let (mut off_rack, mut in_rack): (Vec<BlockManagerId>, Vec<BlockManagerId>) = peers
            .iter()
            .cloned()
            .partition(|p| !racks_covered.contains(&p.topology_info));

        off_rack.shuffle(&mut rng);
        in_rack.shuffle(&mut rng);

        // Off-rack first buys fault-domain diversity; the remainder fills
        // from whatever is left, still randomized.
        let mut prioritized = Vec::with_capacity(num_replicas);
        prioritized.extend(off_rack);
        prioritized.extend(in_rack);
        prioritized.truncate(num_replicas);
        prioritized
    }
}
