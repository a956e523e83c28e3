//! Peer replication with bounded retries
//!
//! Replication is best-effort: a block that reaches fewer peers than its
//! level asked for is logged, not failed. Peer failures force a refresh of
//! the cached peer list and a re-prioritization that excludes both the
//! peers already holding the block and the peers that just failed.

use std::collections::HashSet;
use std::time::Instant;

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use tidal_cluster::replication::BlockReplicationPolicy;
use tidal_cluster::transport::{BlockData, BlockTransport};
use tidal_cluster::PeerCache;
use tidal_common::metrics::{record_replication, record_replication_latency};
use tidal_common::types::{BlockId, BlockManagerId, StorageLevel};

pub struct Replicator {
    transport: Arc<dyn BlockTransport>,
    peers: PeerCache,
    policy: Arc<dyn BlockReplicationPolicy>,
    self_id: BlockManagerId,
    max_replication_failures: u32,
}

impl Replicator {
    #[must_use]
    pub fn new(
        transport: Arc<dyn BlockTransport>,
        peers: PeerCache,
        policy: Arc<dyn BlockReplicationPolicy>,
        self_id: BlockManagerId,
        max_replication_failures: u32,
    ) -> Self {
        Self {
            transport,
            peers,
            policy,
            self_id,
            max_replication_failures,
        }
    }

    /// Drop the cached peer list; the next replication re-fetches it
    pub fn invalidate_peer_cache(&self) {
        self.peers.invalidate();
    }

    /// Replicate `data` to `level.replication - 1` peers beyond the copies
    /// in `existing_replicas`. Returns the peers that received the block;
    /// falling short is a warning, never an error.
    pub fn replicate(
        &self,
        block: &BlockId,
        data: &BlockData,
        level: StorageLevel,
        type_tag: &str,
        existing_replicas: &HashSet<BlockManagerId>,
    ) -> HashSet<BlockManagerId> {
        let start = Instant::now();
        let num_peers_to_replicate_to = usize::from(level.replication.saturating_sub(1));
        let mut peers_replicated_to: HashSet<BlockManagerId> = HashSet::new();
        if num_peers_to_replicate_to == 0 {
            return peers_replicated_to;
        }

        // Peers store a single copy each; the fan-out happens here
        let upload_level = level.with_replication(1);
        let mut peers_failed_to_replicate_to: HashSet<BlockManagerId> = HashSet::new();
        let mut num_failures: u32 = 0;

        let initial_peers = match self.peers.get_peers(false) {
            Ok(peers) => peers,
            Err(e) => {
                warn!("Failed to fetch peers for replicating {}: {}", block, e);
                return peers_replicated_to;
            }
        };
        let mut peers_for_replication = self.policy.prioritize(
            &self.self_id,
            &self.filter_candidates(
                initial_peers,
                existing_replicas,
                &peers_replicated_to,
                &peers_failed_to_replicate_to,
            ),
            &peers_replicated_to,
            block,
            num_peers_to_replicate_to,
        );

        while num_failures <= self.max_replication_failures
            && !peers_for_replication.is_empty()
            && peers_replicated_to.len() < num_peers_to_replicate_to
        {
            let peer = peers_for_replication.remove(0);
            trace!("Replicating {} to {}", block, peer);
            match self
                .transport
                .upload_block_sync(&peer, block, data, upload_level, type_tag)
            {
                Ok(()) => {
                    debug!("Replicated {} to {}", block, peer);
                    record_replication(true);
                    peers_replicated_to.insert(peer);
                }
                Err(e) => {
                    warn!("Failed to replicate {} to {}: {}", block, peer, e);
                    record_replication(false);
                    peers_failed_to_replicate_to.insert(peer);
                    num_failures += 1;

                    // Stale peers are the common cause; refresh and re-rank
                    let refreshed = match self.peers.get_peers(true) {
                        Ok(peers) => peers,
                        Err(e) => {
                            warn!("Failed to refresh peers for {}: {}", block, e);
                            break;
                        }
                    };
                    peers_for_replication = self.policy.prioritize(
                        &self.self_id,
                        &self.filter_candidates(
                            refreshed,
                            existing_replicas,
                            &peers_replicated_to,
                            &peers_failed_to_replicate_to,
                        ),
                        &peers_replicated_to,
                        block,
                        num_peers_to_replicate_to - peers_replicated_to.len(),
                    );
                }
            }
        }

        record_replication_latency(start.elapsed().as_secs_f64() * 1000.0);
        if peers_replicated_to.len() < num_peers_to_replicate_to {
            info!(
                "Block {} replicated to only {} peers instead of {}",
                block,
                peers_replicated_to.len(),
                num_peers_to_replicate_to
            );
        } else {
            debug!(
                "Replicated {} to {} peers in {} ms",
                block,
                peers_replicated_to.len(),
                start.elapsed().as_millis()
            );
        }
        peers_replicated_to
    }

    fn filter_candidates(
        &self,
        peers: Vec<BlockManagerId>,
        existing_replicas: &HashSet<BlockManagerId>,
        peers_replicated_to: &HashSet<BlockManagerId>,
        peers_failed: &HashSet<BlockManagerId>,
    ) -> Vec<BlockManagerId> {
        peers
            .into_iter()
            .filter(|p| {
                *p != self.self_id
                    && !existing_replicas.contains(p)
                    && !peers_replicated_to.contains(p)
                    && !peers_failed.contains(p)
            })
            .collect()
    }
}
