//! Remote block retrieval
//!
//! Locations come from the master and are walked in affinity order: same
//! host, then same rack, then everything else, randomized within each tier
//! to spread load. Repeated failures force a fresh location list; a block
//! whose every location failed resolves to not-found, never an error.

use std::sync::Arc;

use bytes::Bytes;
use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use tidal_cluster::master::MasterClient;
use tidal_cluster::transport::{BlockData, BlockTransport, DownloadFileManager};
use tidal_common::error::Result;
use tidal_common::metrics::{record_location_refresh, record_remote_fetch};
use tidal_common::types::{BlockId, BlockManagerId};

use crate::tempfiles::{RemoteBlockTempFileManager, TempFileGuard};

/// A fetched block. Oversize fetches are file-backed; the guard couples the
/// temp file's lifetime to this value.
pub struct FetchedBlock {
    data: BlockData,
    _guard: Option<TempFileGuard>,
}

impl FetchedBlock {
    #[must_use]
    pub fn size(&self) -> u64 {
        self.data.size()
    }

    #[must_use]
    pub fn data(&self) -> &BlockData {
        &self.data
    }

    /// Materialize the contents in memory. Dropping the value afterwards
    /// releases any backing temp file.
    pub fn into_bytes(self) -> Result<Bytes> {
        self.data.clone().into_bytes()
    }
}

pub struct RemoteFetcher {
    master: Arc<dyn MasterClient>,
    transport: Arc<dyn BlockTransport>,
    temp_files: Arc<RemoteBlockTempFileManager>,
    self_id: BlockManagerId,
    failures_before_location_refresh: u32,
    max_fetch_to_mem: u64,
}

impl RemoteFetcher {
    #[must_use]
    pub fn new(
        master: Arc<dyn MasterClient>,
        transport: Arc<dyn BlockTransport>,
        temp_files: Arc<RemoteBlockTempFileManager>,
        self_id: BlockManagerId,
        failures_before_location_refresh: u32,
        max_fetch_to_mem: u64,
    ) -> Self {
        Self {
            master,
            transport,
            temp_files,
            self_id,
            failures_before_location_refresh,
            max_fetch_to_mem,
        }
    }

    /// Fetch a block from whichever peer holds it. `None` when the master
    /// knows no live location or every location failed.
    pub fn get_remote_bytes(&self, block: &BlockId) -> Result<Option<FetchedBlock>> {
        let Some(locations_and_status) = self.master.get_locations_and_status(block)? else {
            debug!("Block {} has no known locations", block);
            return Ok(None);
        };
        let block_size = locations_and_status
            .status
            .disk_size
            .max(locations_and_status.status.mem_size);
        let fetch_to_disk = block_size > self.max_fetch_to_mem;
        if fetch_to_disk {
            debug!(
                "Block {} is {} bytes, fetching through a temp file",
                block, block_size
            );
        }

        let mut locations = self.sort_locations(locations_and_status.locations);
        if locations.is_empty() {
            return Ok(None);
        }

        // The failure budget grows with every refreshed location list
        let mut allowance = locations.len() as u32;
        let mut running_failures: u32 = 0;
        let mut total_failures: u32 = 0;
        let mut index = 0usize;

        while index < locations.len() {
            let location = &locations[index];
            let temp_manager: Option<&dyn DownloadFileManager> = if fetch_to_disk {
                Some(&*self.temp_files)
            } else {
                None
            };
            match self.transport.fetch_block_sync(
                &location.host,
                location.port,
                &location.executor_id,
                block,
                temp_manager,
            ) {
                Ok(data) => {
                    record_remote_fetch(true);
                    debug!("Fetched {} from {}", block, location);
                    let guard = match &data {
                        BlockData::File { path, .. } => self.temp_files.wrap(path.clone()),
                        BlockData::Bytes(_) => None,
                    };
                    return Ok(Some(FetchedBlock {
                        data,
                        _guard: guard,
                    }));
                }
                Err(e) => {
                    record_remote_fetch(false);
                    running_failures += 1;
                    total_failures += 1;
                    index += 1;
                    warn!(
                        "Failed to fetch {} from {} (failure {}): {}",
                        block, location, total_failures, e
                    );

                    if running_failures >= self.failures_before_location_refresh {
                        record_location_refresh();
                        info!(
                            "Refreshing locations for {} after {} consecutive failures",
                            block, running_failures
                        );
                        locations = self.sort_locations(self.master.get_locations(block)?);
                        allowance = total_failures + locations.len() as u32;
                        running_failures = 0;
                        index = 0;
                    }
                    if total_failures >= allowance {
                        warn!(
                            "Giving up on block {} after {} fetch failures",
                            block, total_failures
                        );
                        return Ok(None);
                    }
                }
            }
        }
        Ok(None)
    }

    /// Order locations by affinity tier, shuffled within each tier
    fn sort_locations(&self, locations: Vec<BlockManagerId>) -> Vec<BlockManagerId> {
        let mut rng = rand::thread_rng();
        let mut same_host = Vec::new();
        let mut same_rack = Vec::new();
        let mut others = Vec::new();

        for location in locations {
            if location == self.self_id {
                continue;
            }
            if location.host == self.self_id.host {
                same_host.push(location);
            } else if self.self_id.topology_info.is_some()
                && location.topology_info == self.self_id.topology_info
            {
                same_rack.push(location);
            } else {
                others.push(location);
            }
        }

        same_host.shuffle(&mut rng);
        same_rack.shuffle(&mut rng);
        others.shuffle(&mut rng);

        let mut sorted = same_host;
        sorted.extend(same_rack);
        sorted.extend(others);
        sorted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicU32, Ordering};

    use parking_lot::Mutex;

    use tidal_cluster::master::BlockLocationsAndStatus;
    use tidal_common::error::{Error, NetworkError};
    use tidal_common::types::{BlockStatus, StorageLevel};

    use crate::disk::DiskBlockManager;

    fn peer(n: u32) -> BlockManagerId {
        BlockManagerId::new(format!("exec-{n}"), format!("host-{n}"), 7078, None)
    }

    fn self_id() -> BlockManagerId {
        BlockManagerId::new("exec-0", "host-0", 7078, None)
    }

    fn block() -> BlockId {
        BlockId::Rdd {
            rdd_id: 1,
            split_index: 0,
        }
    }

    fn status(mem: u64, disk: u64) -> BlockStatus {
        BlockStatus {
            storage_level: StorageLevel::MEMORY_AND_DISK,
            mem_size: mem,
            disk_size: disk,
        }
    }

    struct ScriptedMaster {
        initial: Vec<BlockManagerId>,
        refreshed: Vec<BlockManagerId>,
        size: u64,
        refreshes: AtomicU32,
    }

    impl MasterClient for ScriptedMaster {
        fn register_block_manager(
            &self,
            id: &BlockManagerId,
            _max_on_heap_bytes: u64,
            _max_off_heap_bytes: u64,
            _endpoint_name: &str,
        ) -> tidal_common::error::Result<BlockManagerId> {
            Ok(id.clone())
        }

        fn update_block_info(
            &self,
            _id: &BlockManagerId,
            _block: &BlockId,
            _level: StorageLevel,
            _mem_size: u64,
            _disk_size: u64,
        ) -> tidal_common::error::Result<bool> {
            Ok(true)
        }

        fn get_locations(&self, _block: &BlockId) -> tidal_common::error::Result<Vec<BlockManagerId>> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(self.refreshed.clone())
        }

        fn get_locations_and_status(
            &self,
            _block: &BlockId,
        ) -> tidal_common::error::Result<Option<BlockLocationsAndStatus>> {
            if self.initial.is_empty() {
                return Ok(None);
            }
            Ok(Some(BlockLocationsAndStatus {
                locations: self.initial.clone(),
                status: status(self.size, 0),
            }))
        }

        fn get_peers(&self, _id: &BlockManagerId) -> tidal_common::error::Result<Vec<BlockManagerId>> {
            Ok(vec![])
        }
    }

    struct FailingTransport {
        healthy: HashSet<BlockManagerId>,
        attempts: Mutex<Vec<String>>,
        payload: Bytes,
        spill_to_file: bool,
    }

    impl BlockTransport for FailingTransport {
        fn fetch_block_sync(
            &self,
            host: &str,
            _port: u16,
            executor_id: &str,
            block: &BlockId,
            temp_file_manager: Option<&dyn DownloadFileManager>,
        ) -> tidal_common::error::Result<BlockData> {
            self.attempts.lock().push(executor_id.to_string());
            let healthy = self
                .healthy
                .iter()
                .any(|p| p.host == host && p.executor_id == executor_id);
            if !healthy {
                return Err(Error::Network(NetworkError::FetchFailed {
                    block: block.to_string(),
                    attempts: 1,
                }));
            }
            if self.spill_to_file {
                let manager =
                    temp_file_manager.expect("oversize fetch must carry a temp file manager");
                let path = manager.create_temp_file();
                std::fs::write(&path, &self.payload).unwrap();
                return Ok(BlockData::File {
                    size: self.payload.len() as u64,
                    path,
                });
            }
            Ok(BlockData::Bytes(self.payload.clone()))
        }

        fn upload_block_sync(
            &self,
            _peer: &BlockManagerId,
            _block: &BlockId,
            _data: &BlockData,
            _level: StorageLevel,
            _type_tag: &str,
        ) -> tidal_common::error::Result<()> {
            Ok(())
        }
    }

    fn new_fetcher(
        master: Arc<ScriptedMaster>,
        transport: Arc<FailingTransport>,
    ) -> (RemoteFetcher, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(
            DiskBlockManager::new(&[dir.path().to_string_lossy().to_string()], 64, true).unwrap(),
        );
        let temp_files = Arc::new(RemoteBlockTempFileManager::new(disk));
        let fetcher = RemoteFetcher::new(master, transport, temp_files, self_id(), 5, 1024);
        (fetcher, dir)
    }

    #[test]
    fn fetches_from_a_healthy_location() {
        let master = Arc::new(ScriptedMaster {
            initial: vec![peer(1)],
            refreshed: vec![],
            size: 4,
            refreshes: AtomicU32::new(0),
        });
        let transport = Arc::new(FailingTransport {
            healthy: [peer(1)].into_iter().collect(),
            attempts: Mutex::new(Vec::new()),
            payload: Bytes::from_static(b"data"),
            spill_to_file: false,
        });
        let (fetcher, _dir) = new_fetcher(master, transport);

        let fetched = fetcher.get_remote_bytes(&block()).unwrap().unwrap();
        assert_eq!(fetched.into_bytes().unwrap(), Bytes::from_static(b"data"));
    }

    #[test]
    fn unknown_block_is_none() {
        let master = Arc::new(ScriptedMaster {
            initial: vec![],
            refreshed: vec![],
            size: 0,
            refreshes: AtomicU32::new(0),
        });
        let transport = Arc::new(FailingTransport {
            healthy: HashSet::new(),
            attempts: Mutex::new(Vec::new()),
            payload: Bytes::new(),
            spill_to_file: false,
        });
        let (fetcher, _dir) = new_fetcher(master, transport);

        assert!(fetcher.get_remote_bytes(&block()).unwrap().is_none());
    }

    #[test]
    fn refreshes_locations_after_repeated_failures() {
        // Five stale locations, all dead; the refreshed list has the live one
        let stale: Vec<BlockManagerId> = (1..=5).map(peer).collect();
        let master = Arc::new(ScriptedMaster {
            initial: stale,
            refreshed: vec![peer(6)],
            size: 4,
            refreshes: AtomicU32::new(0),
        });
        let transport = Arc::new(FailingTransport {
            healthy: [peer(6)].into_iter().collect(),
            attempts: Mutex::new(Vec::new()),
            payload: Bytes::from_static(b"data"),
            spill_to_file: false,
        });
        let (fetcher, _dir) = new_fetcher(master.clone(), transport.clone());

        let fetched = fetcher.get_remote_bytes(&block()).unwrap().unwrap();
        assert_eq!(fetched.into_bytes().unwrap(), Bytes::from_static(b"data"));

        assert_eq!(master.refreshes.load(Ordering::SeqCst), 1);
        assert_eq!(transport.attempts.lock().len(), 6);
    }

    #[test]
    fn gives_up_when_every_location_fails() {
        let master = Arc::new(ScriptedMaster {
            initial: vec![peer(1), peer(2)],
            refreshed: vec![],
            size: 4,
            refreshes: AtomicU32::new(0),
        });
        let transport = Arc::new(FailingTransport {
            healthy: HashSet::new(),
            attempts: Mutex::new(Vec::new()),
            payload: Bytes::new(),
            spill_to_file: false,
        });
        let (fetcher, _dir) = new_fetcher(master.clone(), transport.clone());

        assert!(fetcher.get_remote_bytes(&block()).unwrap().is_none());
        // At most one attempt per location, no refresh below the threshold
        assert_eq!(transport.attempts.lock().len(), 2);
        assert_eq!(master.refreshes.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn oversize_blocks_fetch_through_a_temp_file() {
        let payload = Bytes::from(vec![9u8; 2048]);
        let master = Arc::new(ScriptedMaster {
            initial: vec![peer(1)],
            refreshed: vec![],
            size: 2048,
            refreshes: AtomicU32::new(0),
        });
        let transport = Arc::new(FailingTransport {
            healthy: [peer(1)].into_iter().collect(),
            attempts: Mutex::new(Vec::new()),
            payload: payload.clone(),
            spill_to_file: true,
        });
        let (fetcher, _dir) = new_fetcher(master, transport);

        let fetched = fetcher.get_remote_bytes(&block()).unwrap().unwrap();
        let path = match fetched.data() {
            BlockData::File { path, .. } => path.clone(),
            BlockData::Bytes(_) => panic!("expected a file-backed fetch"),
        };
        assert_eq!(fetched.size(), 2048);
        assert_eq!(fetched.into_bytes().unwrap(), payload);

        // Dropping the fetched block released the temp file to the cleaner
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        while path.exists() && std::time::Instant::now() < deadline {
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert!(!path.exists());
    }

    #[test]
    fn locations_sort_by_affinity_tiers() {
        let me = BlockManagerId::new("exec-0", "host-0", 7078, Some("/rack-a".into()));
        let dir = tempfile::tempdir().unwrap();
        let disk = Arc::new(
            DiskBlockManager::new(&[dir.path().to_string_lossy().to_string()], 64, true).unwrap(),
        );
        let temp_files = Arc::new(RemoteBlockTempFileManager::new(disk));
        let master = Arc::new(ScriptedMaster {
            initial: vec![],
            refreshed: vec![],
            size: 0,
            refreshes: AtomicU32::new(0),
        });
        let transport = Arc::new(FailingTransport {
            healthy: HashSet::new(),
            attempts: Mutex::new(Vec::new()),
            payload: Bytes::new(),
            spill_to_file: false,
        });
        let fetcher = RemoteFetcher::new(master, transport, temp_files, me.clone(), 5, 1024);

        let local = BlockManagerId::new("exec-1", "host-0", 7079, Some("/rack-a".into()));
        let racked = BlockManagerId::new("exec-2", "host-2", 7078, Some("/rack-a".into()));
        let distant = BlockManagerId::new("exec-3", "host-3", 7078, Some("/rack-b".into()));

        let sorted = fetcher.sort_locations(vec![
            distant.clone(),
            racked.clone(),
            local.clone(),
            me.clone(),
        ]);
        assert_eq!(sorted, vec![local, racked, distant]);
    }
}
