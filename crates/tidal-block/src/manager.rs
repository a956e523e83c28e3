//! Block manager: admission, placement, status reporting and orchestration
//!
//! One `BlockManager` runs per node. Put paths take the write lock, place
//! the block per its storage level (memory first, disk as fallback), report
//! the resulting status to the master and optionally replicate to peers.
//! Get paths take read locks, probe memory then disk, and fall through to
//! remote fetch. The memory store calls back into `drop_from_memory` when
//! it needs to evict.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use tidal_cluster::master::MasterClient;
use tidal_cluster::replication::create_policy;
use tidal_cluster::topology::TopologyMapper;
use tidal_cluster::transport::{BlockData, BlockTransport, ExternalShuffleClient};
use tidal_cluster::PeerCache;
use tidal_common::config::Config;
use tidal_common::error::{Error, Result, StorageError};
use tidal_common::metrics::{record_bytes_spilled, record_local_read_failure};
use tidal_common::types::{
    BlockId, BlockManagerId, BlockStatus, StorageLevel, TaskAttemptId, NON_TASK_WRITER,
};

use crate::disk::{DiskBlockManager, DiskStore};
use crate::fetch::{FetchedBlock, RemoteFetcher};
use crate::info::{BlockInfo, BlockInfoManager};
use crate::memory::{
    EvictionHandler, MemoryAccountant, MemoryEntry, MemoryStore, SerializedUnrollOutcome,
    UnrollOutcome,
};
use crate::pool::WorkerPool;
use crate::replicate::Replicator;
use crate::shuffle::ShuffleBlockResolver;
use crate::tempfiles::RemoteBlockTempFileManager;
use crate::values::{BlockSerializer, BlockValue};

/// Monotonic suffix for slave endpoint names
static ENDPOINT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Where a read was served from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataReadMethod {
    Memory,
    Disk,
    Network,
}

/// A successful read: the values plus where they came from
pub struct BlockResult<V> {
    pub values: Box<dyn Iterator<Item = V> + Send>,
    pub read_method: DataReadMethod,
    pub bytes: u64,
}

/// Directives the master or peers send to this node's endpoint. All are
/// idempotent: re-delivery is harmless.
#[derive(Debug, Clone)]
pub enum BlockManagerDirective {
    /// Pro-actively re-replicate a block (e.g. a peer is decommissioning)
    ReplicateBlock {
        block: BlockId,
        existing_replicas: Vec<BlockManagerId>,
        max_replicas: u8,
    },
    RemoveBlock(BlockId),
    RemoveRdd(u32),
    RemoveBroadcast(u64),
    RefreshPeers,
}

/// Iterator handed to callers of the local get path: releases the read lock
/// when the values are exhausted, or on drop if abandoned early
struct LockReleasingIterator<V> {
    inner: Box<dyn Iterator<Item = V> + Send>,
    info_manager: Arc<BlockInfoManager>,
    task: TaskAttemptId,
    block: BlockId,
    released: bool,
}

impl<V> LockReleasingIterator<V> {
    fn release(&mut self) {
        if !self.released {
            self.released = true;
            if let Err(e) = self.info_manager.unlock(self.task, &self.block) {
                debug!("Read lock on {} was already gone: {}", self.block, e);
            }
        }
    }
}

impl<V> Iterator for LockReleasingIterator<V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        match self.inner.next() {
            Some(value) => Some(value),
            None => {
                self.release();
                None
            }
        }
    }
}

impl<V> Drop for LockReleasingIterator<V> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Owned iterator over values shared with the memory store
struct SharedValuesIterator<V> {
    values: Arc<Vec<V>>,
    index: usize,
}

impl<V: Clone> Iterator for SharedValuesIterator<V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        let value = self.values.get(self.index).cloned()?;
        self.index += 1;
        Some(value)
    }
}

pub struct BlockManager<V: BlockValue> {
    conf: Config,
    endpoint_name: String,
    id: RwLock<Option<BlockManagerId>>,
    info_manager: Arc<BlockInfoManager>,
    memory_store: Arc<MemoryStore<V>>,
    disk_store: Arc<DiskStore>,
    disk_manager: Arc<DiskBlockManager>,
    master: Arc<dyn MasterClient>,
    transport: Arc<dyn BlockTransport>,
    serializer: Arc<dyn BlockSerializer<V>>,
    topology: Arc<dyn TopologyMapper>,
    shuffle_resolver: Option<Arc<dyn ShuffleBlockResolver>>,
    shuffle_client: Option<Arc<dyn ExternalShuffleClient>>,
    replicator: OnceCell<Replicator>,
    fetcher: OnceCell<RemoteFetcher>,
    temp_files: Arc<RemoteBlockTempFileManager>,
    pool: WorkerPool,
    reregistering: AtomicBool,
    task_statuses: DashMap<TaskAttemptId, Vec<(BlockId, BlockStatus)>>,
    weak_self: OnceCell<Weak<BlockManager<V>>>,
}

impl<V: BlockValue> BlockManager<V> {
    /// Build the manager and its stores. [`BlockManager::initialize`] must
    /// run before any put or get.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        conf: Config,
        master: Arc<dyn MasterClient>,
        transport: Arc<dyn BlockTransport>,
        serializer: Arc<dyn BlockSerializer<V>>,
        accountant: Arc<dyn MemoryAccountant>,
        topology: Arc<dyn TopologyMapper>,
        shuffle_resolver: Option<Arc<dyn ShuffleBlockResolver>>,
        shuffle_client: Option<Arc<dyn ExternalShuffleClient>>,
    ) -> Result<Arc<Self>> {
        let endpoint_name = format!(
            "BlockManagerEndpoint{}",
            ENDPOINT_COUNTER.fetch_add(1, Ordering::SeqCst) + 1
        );
        let info_manager = Arc::new(BlockInfoManager::new());
        let delete_files_on_stop = !conf.shuffle.service_enabled;
        let disk_manager = Arc::new(DiskBlockManager::new(
            &conf.storage.local_dirs,
            conf.storage.sub_dirs_per_local_dir,
            delete_files_on_stop,
        )?);
        let disk_store = Arc::new(DiskStore::new(Arc::clone(&disk_manager)));
        let memory_store = Arc::new(MemoryStore::new(
            accountant,
            Arc::clone(&info_manager),
            Arc::clone(&serializer),
            conf.storage.unroll_initial_reservation_bytes,
        ));
        let temp_files = Arc::new(RemoteBlockTempFileManager::new(Arc::clone(&disk_manager)));
        let pool = WorkerPool::new("block-manager", conf.replication.worker_threads);

        let manager = Arc::new(Self {
            conf,
            endpoint_name,
            id: RwLock::new(None),
            info_manager,
            memory_store,
            disk_store,
            disk_manager,
            master,
            transport,
            serializer,
            topology,
            shuffle_resolver,
            shuffle_client,
            replicator: OnceCell::new(),
            fetcher: OnceCell::new(),
            temp_files,
            pool,
            reregistering: AtomicBool::new(false),
            task_statuses: DashMap::new(),
            weak_self: OnceCell::new(),
        });

        let _ = manager.weak_self.set(Arc::downgrade(&manager));
        let handler: Weak<dyn EvictionHandler<V>> =
            Arc::downgrade(&manager) as Weak<dyn EvictionHandler<V>>;
        manager.memory_store.attach_eviction_handler(handler);
        Ok(manager)
    }

    /// Register with the master and wire up the peer-facing machinery. The
    /// master may canonicalize our id (e.g. attach topology).
    pub fn initialize(&self) -> Result<()> {
        let topology_info = self
            .conf
            .node
            .topology
            .clone()
            .or_else(|| self.topology.topology_for_host(&self.conf.node.host));
        let provisional = BlockManagerId::new(
            self.conf.node.executor_id.clone(),
            self.conf.node.host.clone(),
            self.conf.node.port,
            topology_info,
        );

        let id = self.master.register_block_manager(
            &provisional,
            self.conf.storage.on_heap_memory_bytes,
            self.conf.storage.off_heap_memory_bytes,
            &self.endpoint_name,
        )?;
        *self.id.write() = Some(id.clone());

        let peer_cache = PeerCache::new(
            Arc::clone(&self.master),
            id.clone(),
            Duration::from_millis(self.conf.replication.cached_peers_ttl_ms),
        );
        let policy = create_policy(&self.conf.replication.policy)?;
        let _ = self.replicator.set(Replicator::new(
            Arc::clone(&self.transport),
            peer_cache,
            policy,
            id.clone(),
            self.conf.replication.max_failures,
        ));
        let _ = self.fetcher.set(RemoteFetcher::new(
            Arc::clone(&self.master),
            Arc::clone(&self.transport),
            Arc::clone(&self.temp_files),
            id.clone(),
            self.conf.fetch.failures_before_location_refresh,
            self.conf.fetch.max_remote_block_size_fetch_to_mem,
        ));

        if self.conf.shuffle.service_enabled {
            self.register_with_external_shuffle_service()?;
        }

        info!("Initialized block manager {} ({})", id, self.endpoint_name);
        Ok(())
    }

    /// This node's canonical id, available after `initialize`
    pub fn id(&self) -> Result<BlockManagerId> {
        self.id
            .read()
            .clone()
            .ok_or_else(|| Error::Internal("Block manager is not initialized".into()))
    }

    #[must_use]
    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    #[must_use]
    pub fn memory_store(&self) -> &Arc<MemoryStore<V>> {
        &self.memory_store
    }

    #[must_use]
    pub fn disk_store(&self) -> &Arc<DiskStore> {
        &self.disk_store
    }

    #[must_use]
    pub fn info_manager(&self) -> &Arc<BlockInfoManager> {
        &self.info_manager
    }

    #[must_use]
    pub fn temp_file_manager(&self) -> &Arc<RemoteBlockTempFileManager> {
        &self.temp_files
    }

    // ========================================================================
    // Put paths
    // ========================================================================

    /// Store serialized bytes locally per `level`, replicating if the level
    /// asks for more than one copy. Returns whether the block is present
    /// locally afterwards (a block that already existed counts).
    pub fn put_bytes(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        bytes: Bytes,
        level: StorageLevel,
        tell_master: bool,
    ) -> Result<bool> {
        self.do_put_bytes(task, block, bytes, level, tell_master, false)
    }

    /// Store an iterator of values locally per `level`. Returns `true` when
    /// the block was fully stored, `false` when no tier could take it.
    pub fn put_iterator(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        values: Box<dyn Iterator<Item = V> + Send>,
        level: StorageLevel,
        tell_master: bool,
    ) -> Result<bool> {
        let leftover = self.do_put_iterator(task, block, values, level, tell_master, false)?;
        Ok(leftover.is_none())
    }

    fn do_put_bytes(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        bytes: Bytes,
        level: StorageLevel,
        tell_master: bool,
        keep_read_lock: bool,
    ) -> Result<bool> {
        let type_tag = std::any::type_name::<V>();
        let result: Option<()> =
            self.do_put(task, block, level, type_tag, tell_master, keep_read_lock, || {
                // Bytes are ready to send, so replication overlaps with
                // local placement and is awaited before the put returns
                let replication = if level.replication > 1 {
                    self.spawn_replication(block, BlockData::Bytes(bytes.clone()), level, type_tag)
                } else {
                    None
                };

                let size = bytes.len() as u64;
                if level.use_memory {
                    // A deserialized level keeps typed values in memory, so
                    // incoming bytes are decoded on the way in
                    let in_memory = if level.deserialized {
                        let values = self.serializer.deserialize_all(&mut bytes.as_ref())?;
                        match self.memory_store.put_iterator_as_values(
                            task,
                            block,
                            Box::new(values.into_iter()),
                        )? {
                            UnrollOutcome::Stored(_) => true,
                            UnrollOutcome::NotEnoughSpace(partial) => {
                                drop(partial);
                                false
                            }
                        }
                    } else {
                        let mode = level.memory_mode();
                        let for_store = bytes.clone();
                        self.memory_store
                            .put_bytes(task, block, size, mode, || Ok(for_store))?
                    };
                    if !in_memory && level.use_disk {
                        self.disk_store.put_bytes(block, &bytes)?;
                    }
                } else if level.use_disk {
                    self.disk_store.put_bytes(block, &bytes)?;
                }

                let status = self.get_current_block_status(block);
                if status.storage_level.is_valid() {
                    self.info_manager.set_size(task, block, size)?;
                    if tell_master {
                        self.report_block_status(block, status);
                    }
                    self.track_updated_status(task, block, status);
                }

                if let Some(handle) = replication {
                    if let Err(e) = handle.wait() {
                        warn!("Replication of {} did not complete: {}", block, e);
                    }
                }
                Ok(None)
            })?;
        Ok(result.is_none())
    }

    fn do_put_iterator(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        values: Box<dyn Iterator<Item = V> + Send>,
        level: StorageLevel,
        tell_master: bool,
        keep_read_lock: bool,
    ) -> Result<Option<Box<dyn Iterator<Item = V> + Send>>> {
        let type_tag = std::any::type_name::<V>();
        self.do_put(task, block, level, type_tag, tell_master, keep_read_lock, || {
            let size;
            if level.use_memory {
                if level.deserialized {
                    match self.memory_store.put_iterator_as_values(task, block, values)? {
                        UnrollOutcome::Stored(stored) => size = stored,
                        UnrollOutcome::NotEnoughSpace(partial) => {
                            if level.use_disk {
                                let mut partial = partial;
                                size = self.disk_store.put(block, |out| {
                                    self.serializer.serialize_stream(&mut partial, out)
                                })?;
                            } else {
                                return Ok(Some(
                                    Box::new(partial) as Box<dyn Iterator<Item = V> + Send>
                                ));
                            }
                        }
                    }
                } else {
                    let mode = level.memory_mode();
                    match self
                        .memory_store
                        .put_iterator_as_bytes(task, block, values, mode)?
                    {
                        SerializedUnrollOutcome::Stored(stored) => size = stored,
                        SerializedUnrollOutcome::NotEnoughSpace(partial) => {
                            if level.use_disk {
                                size = self
                                    .disk_store
                                    .put(block, |out| partial.finish_writing_to_stream(out))?;
                            } else {
                                return Ok(Some(partial.into_values_iterator()?));
                            }
                        }
                    }
                }
            } else {
                let mut values = values;
                size = self.disk_store.put(block, |out| {
                    self.serializer.serialize_stream(&mut values, out)
                })?;
            }

            let status = self.get_current_block_status(block);
            if status.storage_level.is_valid() {
                self.info_manager.set_size(task, block, size)?;
                if tell_master {
                    self.report_block_status(block, status);
                }
                self.track_updated_status(task, block, status);

                // Values must first exist locally before they can be
                // shipped; replication follows placement here
                if level.replication > 1 {
                    match self.serialized_local_bytes(block, level) {
                        Ok(data) => {
                            self.replicate(block, &data, level, type_tag, &HashSet::new());
                        }
                        Err(e) => {
                            warn!("Could not read back {} for replication: {}", block, e);
                        }
                    }
                }
            }
            Ok(None)
        })
    }

    /// The shared put skeleton: take the write lock on a fresh info entry,
    /// run the placement body, verify the resulting status, then downgrade
    /// or release. `Ok(None)` from the body means placed; `Ok(Some(_))`
    /// carries leftover work product from a graceful failure.
    fn do_put<T, F>(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        level: StorageLevel,
        type_tag: &str,
        tell_master: bool,
        keep_read_lock: bool,
        body: F,
    ) -> Result<Option<T>>
    where
        F: FnOnce() -> Result<Option<T>>,
    {
        if !level.is_valid() {
            return Err(Error::Storage(StorageError::InvalidStorageLevel(
                level.to_string(),
            )));
        }

        let new_info = BlockInfo::new(level, type_tag, tell_master);
        if !self
            .info_manager
            .lock_new_block_for_writing(task, block, new_info)
        {
            debug!("Block {} already exists on this machine; not re-adding it", block);
            if !keep_read_lock {
                self.info_manager.unlock(task, block)?;
            }
            return Ok(None);
        }

        let start = Instant::now();
        match body() {
            Ok(None) => {
                let status = self.get_current_block_status(block);
                if !status.storage_level.is_valid() {
                    self.remove_block_internal(task, block, false);
                    return Err(Error::Storage(StorageError::WriteFailed(
                        block.to_string(),
                        "no storage tier accepted the block".into(),
                    )));
                }
                if keep_read_lock {
                    self.info_manager.downgrade_lock(task, block)?;
                } else {
                    self.info_manager.unlock(task, block)?;
                }
                debug!(
                    "Putting block {} took {} ms",
                    block,
                    start.elapsed().as_millis()
                );
                Ok(None)
            }
            Ok(Some(leftover)) => {
                warn!("Putting block {} failed", block);
                self.remove_block_internal(task, block, false);
                Ok(Some(leftover))
            }
            Err(e) => {
                warn!("Putting block {} failed due to exception: {}", block, e);
                // Placement may have been reported before the failure; the
                // master must not keep advertising the block
                self.remove_block_internal(task, block, tell_master);
                Err(e)
            }
        }
    }

    fn spawn_replication(
        &self,
        block: &BlockId,
        data: BlockData,
        level: StorageLevel,
        type_tag: &str,
    ) -> Option<crate::pool::TaskHandle<()>> {
        let Some(this) = self.weak_self.get().and_then(Weak::upgrade) else {
            return None;
        };
        let block = block.clone();
        let type_tag = type_tag.to_string();
        Some(self.pool.submit(move || {
            this.replicate(&block, &data, level, &type_tag, &HashSet::new());
        }))
    }

    /// Replicate a block's bytes to peers. Delegates to the replicator;
    /// falling short of the target is logged there, not surfaced.
    pub fn replicate(
        &self,
        block: &BlockId,
        data: &BlockData,
        level: StorageLevel,
        type_tag: &str,
        existing_replicas: &HashSet<BlockManagerId>,
    ) -> HashSet<BlockManagerId> {
        match self.replicator.get() {
            Some(replicator) => {
                replicator.replicate(block, data, level, type_tag, existing_replicas)
            }
            None => {
                warn!("Replication requested before initialization; skipping");
                HashSet::new()
            }
        }
    }

    // ========================================================================
    // Get paths
    // ========================================================================

    /// Read a block's values from the local tiers. The returned iterator
    /// holds a read lock on the block until exhausted or dropped.
    pub fn get_local_values(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
    ) -> Result<Option<BlockResult<V>>> {
        let Some(info) = self.info_manager.lock_for_reading(task, block, true) else {
            return Ok(None);
        };
        let level = info.level;

        let outcome = self.read_local_values(task, block, level);
        match outcome {
            Ok((inner, read_method, bytes)) => {
                let iterator = LockReleasingIterator {
                    inner,
                    info_manager: Arc::clone(&self.info_manager),
                    task,
                    block: block.clone(),
                    released: false,
                };
                Ok(Some(BlockResult {
                    values: Box::new(iterator),
                    read_method,
                    bytes,
                }))
            }
            Err(e) => Err(self.handle_local_read_failure(task, block, &e)),
        }
    }

    #[allow(clippy::type_complexity)]
    fn read_local_values(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        level: StorageLevel,
    ) -> Result<(Box<dyn Iterator<Item = V> + Send>, DataReadMethod, u64)> {
        if level.use_memory && self.memory_store.contains(block) {
            let size = self.memory_store.get_size(block).unwrap_or(0);
            let inner: Box<dyn Iterator<Item = V> + Send> = if level.deserialized {
                let values = self.memory_store.get_values(block).ok_or_else(|| {
                    Error::Storage(StorageError::ReadFailed(
                        block.to_string(),
                        "memory entry changed form under a read lock".into(),
                    ))
                })?;
                Box::new(SharedValuesIterator { values, index: 0 })
            } else {
                let bytes = self.memory_store.get_bytes(block).ok_or_else(|| {
                    Error::Storage(StorageError::ReadFailed(
                        block.to_string(),
                        "memory entry changed form under a read lock".into(),
                    ))
                })?;
                Box::new(self.serializer.deserialize_all(&mut bytes.as_ref())?.into_iter())
            };
            return Ok((inner, DataReadMethod::Memory, size));
        }

        if level.use_disk && self.disk_store.contains(block) {
            let bytes = self.disk_store.get_bytes(block)?;
            let read_bytes = bytes.len() as u64;
            let values = self.serializer.deserialize_all(&mut bytes.as_ref())?;
            let inner = self.maybe_cache_from_disk(task, block, level, bytes, values);
            return Ok((inner, DataReadMethod::Disk, read_bytes));
        }

        Err(Error::Storage(StorageError::BlockNotFound(
            block.to_string(),
        )))
    }

    /// After serving a disk read for a memory-capable level, try to pull
    /// the block back into memory so the next read is cheap. Failure to
    /// cache never fails the read.
    fn maybe_cache_from_disk(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        level: StorageLevel,
        bytes: Bytes,
        values: Vec<V>,
    ) -> Box<dyn Iterator<Item = V> + Send> {
        if !level.use_memory {
            return Box::new(values.into_iter());
        }

        if level.deserialized {
            let unroll =
                self.memory_store
                    .put_iterator_as_values(task, block, Box::new(values.clone().into_iter()));
            match unroll {
                Ok(UnrollOutcome::Stored(_)) => {
                    if let Some(cached) = self.memory_store.get_values(block) {
                        debug!("Re-cached {} into memory after a disk read", block);
                        return Box::new(SharedValuesIterator {
                            values: cached,
                            index: 0,
                        });
                    }
                }
                Ok(UnrollOutcome::NotEnoughSpace(partial)) => drop(partial),
                Err(e) => debug!("Re-cache of {} failed: {}", block, e),
            }
        } else {
            let size = bytes.len() as u64;
            let mode = level.memory_mode();
            let cached = self
                .memory_store
                .put_bytes(task, block, size, mode, || Ok(bytes));
            match cached {
                Ok(true) => debug!("Re-cached {} into memory after a disk read", block),
                Ok(false) => {}
                Err(e) => debug!("Re-cache of {} failed: {}", block, e),
            }
        }
        Box::new(values.into_iter())
    }

    /// Read a block's serialized bytes from the local tiers. Shuffle blocks
    /// bypass the lock manager and come from the shuffle resolver.
    pub fn get_local_bytes(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
    ) -> Result<Option<BlockData>> {
        if block.is_shuffle() {
            let resolver = self.shuffle_resolver.as_ref().ok_or_else(|| {
                Error::Internal("Shuffle block requested but no shuffle resolver wired".into())
            })?;
            return resolver.get_block_data(block).map(Some);
        }

        let Some(info) = self.info_manager.lock_for_reading(task, block, true) else {
            return Ok(None);
        };
        match self.serialized_local_bytes(block, info.level) {
            Ok(data) => {
                self.info_manager.unlock(task, block)?;
                Ok(Some(data))
            }
            Err(e) => Err(self.handle_local_read_failure(task, block, &e)),
        }
    }

    /// Serialized form of a locally present block. For deserialized levels
    /// the on-disk copy is preferred: it is already serialized, while the
    /// memory copy would need a fresh serialization. For serialized levels
    /// memory wins.
    fn serialized_local_bytes(&self, block: &BlockId, level: StorageLevel) -> Result<BlockData> {
        if level.deserialized {
            if self.disk_store.contains(block) {
                return Ok(BlockData::Bytes(self.disk_store.get_bytes(block)?));
            }
            if let Some(values) = self.memory_store.get_values(block) {
                let mut buffer = Vec::new();
                let mut iter = SharedValuesIterator { values, index: 0 };
                self.serializer.serialize_stream(&mut iter, &mut buffer)?;
                return Ok(BlockData::Bytes(Bytes::from(buffer)));
            }
        } else {
            if let Some(bytes) = self.memory_store.get_bytes(block) {
                return Ok(BlockData::Bytes(bytes));
            }
            if self.disk_store.contains(block) {
                return Ok(BlockData::Bytes(self.disk_store.get_bytes(block)?));
            }
        }
        Err(Error::Storage(StorageError::BlockNotFound(
            block.to_string(),
        )))
    }

    /// Read a block from anywhere: locally first, then from a remote peer
    pub fn get(&self, task: TaskAttemptId, block: &BlockId) -> Result<Option<BlockResult<V>>> {
        if let Some(local) = self.get_local_values(task, block)? {
            debug!("Found block {} locally", block);
            return Ok(Some(local));
        }

        if let Some(fetched) = self.get_remote_bytes(block)? {
            debug!("Found block {} remotely", block);
            let size = fetched.size();
            let bytes = fetched.into_bytes()?;
            let values = self.serializer.deserialize_all(&mut bytes.as_ref())?;
            return Ok(Some(BlockResult {
                values: Box::new(values.into_iter()),
                read_method: DataReadMethod::Network,
                bytes: size,
            }));
        }
        Ok(None)
    }

    /// Fetch a block's bytes from a remote holder
    pub fn get_remote_bytes(&self, block: &BlockId) -> Result<Option<FetchedBlock>> {
        let fetcher = self
            .fetcher
            .get()
            .ok_or_else(|| Error::Internal("Block manager is not initialized".into()))?;
        fetcher.get_remote_bytes(block)
    }

    /// A present-but-unreadable block is corrupt: drop it everywhere, tell
    /// the master, and surface the corruption to the caller.
    fn handle_local_read_failure(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        cause: &Error,
    ) -> Error {
        warn!(
            "Block {} was marked as present but could not be read: {}",
            block, cause
        );
        record_local_read_failure();
        if let Err(e) = self.info_manager.unlock(task, block) {
            debug!("Releasing the read lock on {} failed: {}", block, e);
        }
        if let Err(e) = self.remove_block(task, block, true) {
            warn!("Removing unreadable block {} failed: {}", block, e);
        }
        Error::Storage(StorageError::CorruptData(
            block.to_string(),
            cause.to_string(),
        ))
    }

    // ========================================================================
    // Status reporting
    // ========================================================================

    /// Synthesize the block's live status from the stores. Stale info
    /// fields are never trusted; only presence in the tiers counts.
    #[must_use]
    pub fn get_current_block_status(&self, block: &BlockId) -> BlockStatus {
        let Some(info) = self.info_manager.get(block) else {
            return BlockStatus::empty();
        };
        let in_mem = self.memory_store.contains(block);
        let on_disk = self.disk_store.contains(block);

        let mem_size = if in_mem {
            self.memory_store.get_size(block).unwrap_or(0)
        } else {
            0
        };
        let disk_size = if on_disk { self.disk_store.get_size(block) } else { 0 };
        let replication = if in_mem || on_disk {
            info.level.replication
        } else {
            1
        };
        let storage_level = StorageLevel::new(
            on_disk,
            in_mem,
            info.level.use_off_heap && in_mem,
            info.level.deserialized && in_mem,
            replication,
        );
        BlockStatus {
            storage_level,
            mem_size,
            disk_size,
        }
    }

    /// Current status of a tracked block
    #[must_use]
    pub fn get_status(&self, block: &BlockId) -> Option<BlockStatus> {
        self.info_manager
            .get(block)
            .map(|_| self.get_current_block_status(block))
    }

    /// All blocks known locally (tracked or on disk) passing `filter`
    #[must_use]
    pub fn get_matching_block_ids(&self, filter: impl Fn(&BlockId) -> bool) -> Vec<BlockId> {
        let mut seen = HashSet::new();
        let mut matching = Vec::new();
        for (block, _) in self.info_manager.entries() {
            if filter(&block) && seen.insert(block.clone()) {
                matching.push(block);
            }
        }
        for block in self.disk_manager.all_blocks() {
            if filter(&block) && seen.insert(block.clone()) {
                matching.push(block);
            }
        }
        matching
    }

    /// Report a status change to the master. An unknown-sender reply
    /// schedules an asynchronous re-registration.
    fn report_block_status(&self, block: &BlockId, status: BlockStatus) {
        let tell_master = self
            .info_manager
            .get(block)
            .map_or(true, |info| info.tell_master);
        if !tell_master {
            return;
        }
        if !self.try_to_report_block_status(block, status) {
            warn!(
                "Master does not know this block manager; re-registering ({})",
                block
            );
            self.async_reregister();
        }
    }

    /// Returns false when the master asked us to re-register. RPC failures
    /// are silent: the next heartbeat re-drives reporting.
    fn try_to_report_block_status(&self, block: &BlockId, status: BlockStatus) -> bool {
        let Ok(id) = self.id() else {
            return true;
        };
        match self.master.update_block_info(
            &id,
            block,
            status.storage_level,
            status.mem_size,
            status.disk_size,
        ) {
            Ok(acknowledged) => acknowledged,
            Err(e) => {
                warn!("Failed to report status of {}: {}", block, e);
                true
            }
        }
    }

    /// Re-send every tracked block's status, e.g. after re-registration.
    /// Individual failures are skipped; the next heartbeat retries.
    pub fn report_all_blocks(&self) {
        let entries = self.info_manager.entries();
        info!("Reporting {} blocks to the master", entries.len());
        for (block, info) in entries {
            if !info.tell_master {
                continue;
            }
            let status = self.get_current_block_status(&block);
            if !self.try_to_report_block_status(&block, status) {
                warn!("Master returned unknown block manager while reporting {}", block);
                return;
            }
        }
    }

    /// Re-register with the master and re-report all blocks
    pub fn reregister(&self) -> Result<()> {
        let id = self.id()?;
        info!("Re-registering block manager {}", id);
        self.master.register_block_manager(
            &id,
            self.conf.storage.on_heap_memory_bytes,
            self.conf.storage.off_heap_memory_bytes,
            &self.endpoint_name,
        )?;
        self.report_all_blocks();
        Ok(())
    }

    fn async_reregister(&self) {
        if self.reregistering.swap(true, Ordering::SeqCst) {
            return;
        }
        let Some(this) = self.weak_self.get().and_then(Weak::upgrade) else {
            self.reregistering.store(false, Ordering::SeqCst);
            return;
        };
        let _ = self.pool.submit(move || {
            if let Err(e) = this.reregister() {
                warn!("Asynchronous re-registration failed: {}", e);
            }
            this.reregistering.store(false, Ordering::SeqCst);
        });
    }

    fn track_updated_status(&self, task: TaskAttemptId, block: &BlockId, status: BlockStatus) {
        if !self.conf.storage.track_updated_block_statuses || task == NON_TASK_WRITER {
            return;
        }
        self.task_statuses
            .entry(task)
            .or_default()
            .push((block.clone(), status));
    }

    /// Block status changes recorded for a task's metrics
    #[must_use]
    pub fn updated_block_statuses(&self, task: TaskAttemptId) -> Vec<(BlockId, BlockStatus)> {
        self.task_statuses
            .get(&task)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    // ========================================================================
    // Removal and task boundaries
    // ========================================================================

    /// Remove a block from every tier. A block that is currently locked is
    /// waited for; a block that does not exist is a no-op.
    pub fn remove_block(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        tell_master: bool,
    ) -> Result<()> {
        match self.info_manager.lock_for_writing(task, block, true) {
            None => {
                debug!("Block {} was already removed", block);
                Ok(())
            }
            Some(info) => {
                self.remove_block_internal(task, block, tell_master && info.tell_master);
                Ok(())
            }
        }
    }

    /// Remove every block of a dataset. Initiated by the driver's cleaner,
    /// so the master is not separately notified per block.
    pub fn remove_rdd(&self, rdd_id: u32) -> usize {
        info!("Removing cached dataset {}", rdd_id);
        let blocks: Vec<BlockId> = self
            .info_manager
            .entries()
            .into_iter()
            .map(|(block, _)| block)
            .filter(|b| b.rdd_id() == Some(rdd_id))
            .collect();
        for block in &blocks {
            if let Err(e) = self.remove_block(NON_TASK_WRITER, block, false) {
                warn!("Failed to remove {}: {}", block, e);
            }
        }
        blocks.len()
    }

    /// Remove every piece of a broadcast variable
    pub fn remove_broadcast(&self, broadcast_id: u64, tell_master: bool) -> usize {
        debug!("Removing broadcast {}", broadcast_id);
        let blocks: Vec<BlockId> = self
            .info_manager
            .entries()
            .into_iter()
            .map(|(block, _)| block)
            .filter(
                |b| matches!(b, BlockId::Broadcast { broadcast_id: id, .. } if *id == broadcast_id),
            )
            .collect();
        for block in &blocks {
            if let Err(e) = self.remove_block(NON_TASK_WRITER, block, tell_master) {
                warn!("Failed to remove {}: {}", block, e);
            }
        }
        blocks.len()
    }

    /// Drop the block from both stores and erase its info entry. Caller
    /// holds the write lock.
    fn remove_block_internal(&self, task: TaskAttemptId, block: &BlockId, tell_master: bool) {
        let removed_from_memory = self.memory_store.remove(block);
        let removed_from_disk = self.disk_store.remove(block);
        if !removed_from_memory && !removed_from_disk {
            debug!("Block {} was not present in any store", block);
        }
        if tell_master {
            self.report_block_status(block, BlockStatus::empty());
        }
        if let Err(e) = self.info_manager.remove_block(task, block) {
            warn!("Failed to erase info entry for {}: {}", block, e);
        }
    }

    /// Task boundary: release every lock and unroll reservation the task
    /// still holds, and surface its recorded status updates.
    pub fn on_task_completion(&self, task: TaskAttemptId) -> Vec<(BlockId, BlockStatus)> {
        let released = self.info_manager.release_all_locks_for_task(task);
        if !released.is_empty() {
            debug!("Task {} released {} leaked locks", task, released.len());
        }
        self.memory_store.release_unroll_memory_for_task(task);
        self.task_statuses
            .remove(&task)
            .map(|(_, statuses)| statuses)
            .unwrap_or_default()
    }

    // ========================================================================
    // Directives and shuffle service
    // ========================================================================

    /// Handle a directive from the master or a peer endpoint
    pub fn handle_directive(&self, directive: BlockManagerDirective) -> Result<()> {
        match directive {
            BlockManagerDirective::ReplicateBlock {
                block,
                existing_replicas,
                max_replicas,
            } => {
                let Some(info) = self.info_manager.lock_for_reading(NON_TASK_WRITER, &block, true)
                else {
                    debug!("Asked to replicate {}, which is not stored here", block);
                    return Ok(());
                };
                let result = self.serialized_local_bytes(&block, info.level);
                match result {
                    Ok(data) => {
                        let level = info.level.with_replication(max_replicas);
                        let existing: HashSet<BlockManagerId> =
                            existing_replicas.into_iter().collect();
                        self.replicate(&block, &data, level, &info.type_tag, &existing);
                        self.info_manager.unlock(NON_TASK_WRITER, &block)?;
                        Ok(())
                    }
                    Err(e) => Err(self.handle_local_read_failure(NON_TASK_WRITER, &block, &e)),
                }
            }
            BlockManagerDirective::RemoveBlock(block) => {
                self.remove_block(NON_TASK_WRITER, &block, true)
            }
            BlockManagerDirective::RemoveRdd(rdd_id) => {
                self.remove_rdd(rdd_id);
                Ok(())
            }
            BlockManagerDirective::RemoveBroadcast(broadcast_id) => {
                self.remove_broadcast(broadcast_id, true);
                Ok(())
            }
            BlockManagerDirective::RefreshPeers => {
                if let Some(replicator) = self.replicator.get() {
                    replicator.invalidate_peer_cache();
                }
                Ok(())
            }
        }
    }

    fn register_with_external_shuffle_service(&self) -> Result<()> {
        let Some(client) = &self.shuffle_client else {
            return Err(Error::Config(
                "External shuffle service enabled but no client provided".into(),
            ));
        };
        let id = self.id()?;
        info!("Registering with external shuffle service on {}", id.host);

        let max_attempts = self.conf.shuffle.registration_max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match client.register_with_shuffle_server(
                &id.host,
                self.conf.shuffle.service_port,
                &id.executor_id,
                &self.disk_manager.local_dirs(),
                self.disk_manager.sub_dirs_per_local_dir(),
            ) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(
                        "Shuffle service registration attempt {}/{} failed: {}",
                        attempt, max_attempts, e
                    );
                    if attempt < max_attempts {
                        std::thread::sleep(Duration::from_millis(
                            self.conf.shuffle.registration_retry_wait_ms,
                        ));
                    }
                }
            }
        }
        Err(Error::Cluster(
            tidal_common::error::ClusterError::ShuffleRegistrationFailed(max_attempts),
        ))
    }

    /// Shut down background machinery and the disk tier
    pub fn stop(&self) {
        self.pool.shutdown();
        self.temp_files.stop();
        self.disk_manager.stop();
        info!("Block manager stopped");
    }
}

impl<V: BlockValue> EvictionHandler<V> for BlockManager<V> {
    /// Move a memory-pressure victim out of memory, spilling to disk first
    /// when its level allows. Called by the memory store with the write
    /// lock on `block` held; on return the block is no longer in memory.
    fn drop_from_memory(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        entry: &MemoryEntry<V>,
    ) -> Result<StorageLevel> {
        info!("Dropping block {} from memory", block);
        let info = self
            .info_manager
            .assert_block_is_locked_for_writing(task, block)?;
        let level = info.level;

        if level.use_disk && !self.disk_store.contains(block) {
            debug!("Writing block {} to disk", block);
            match entry {
                MemoryEntry::Values { values, .. } => {
                    let mut iter = SharedValuesIterator {
                        values: Arc::clone(values),
                        index: 0,
                    };
                    self.disk_store
                        .put(block, |out| self.serializer.serialize_stream(&mut iter, out))?;
                }
                MemoryEntry::Bytes { bytes, .. } => {
                    self.disk_store.put_bytes(block, bytes)?;
                }
            }
            record_bytes_spilled(entry.size());
        }

        if !self.memory_store.remove(block) {
            debug!("Block {} had already left memory", block);
        }

        let status = self.get_current_block_status(block);
        if info.tell_master {
            self.report_block_status(block, status);
        }
        self.track_updated_status(task, block, status);
        Ok(status.storage_level)
    }
}
