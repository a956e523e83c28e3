//! TTL-cached view of the cluster's peer set

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::debug;

use tidal_common::error::Result;
use tidal_common::types::BlockManagerId;

use crate::master::MasterClient;

/// Caches the peer list fetched from the master for a bounded time, so that
/// replicating many blocks in a burst does not hammer the directory. A
/// replication failure forces a refresh regardless of age.
pub struct PeerCache {
    master: Arc<dyn MasterClient>,
    self_id: BlockManagerId,
    ttl: Duration,
    cached: RwLock<Option<CachedPeers>>,
}

struct CachedPeers {
    fetched_at: Instant,
    peers: Vec<BlockManagerId>,
}

impl PeerCache {
    #[must_use]
    pub fn new(master: Arc<dyn MasterClient>, self_id: BlockManagerId, ttl: Duration) -> Self {
        Self {
            master,
            self_id,
            ttl,
            cached: RwLock::new(None),
        }
    }

    /// The current peer set, refreshed from the master when stale or when
    /// `force_refresh` is set.
    pub fn get_peers(&self, force_refresh: bool) -> Result<Vec<BlockManagerId>> {
        if !force_refresh {
            let cached = self.cached.read();
            if let Some(entry) = cached.as_ref() {
                if entry.fetched_at.elapsed() < self.ttl {
                    return Ok(entry.peers.clone());
                }
            }
        }

        let peers = self.master.get_peers(&self.self_id)?;
        debug!("Fetched {} peers from master", peers.len());
        *self.cached.write() = Some(CachedPeers {
            fetched_at: Instant::now(),
            peers: peers.clone(),
        });
        Ok(peers)
    }

    /// Drop the cached list so the next read hits the master
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }
}
