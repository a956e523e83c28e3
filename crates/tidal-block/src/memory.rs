//! Bounded in-memory block tier
//!
//! Blocks are held either as typed values or as serialized bytes, within a
//! budget dictated by the memory accountant. When a reservation cannot be
//! satisfied, least-recently-used blocks are evicted through the
//! [`EvictionHandler`] the owner attached at construction. Iterators are
//! admitted incrementally ("unrolled") so a too-large block fails cheaply
//! instead of materializing first and exploding the heap.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, warn};

use tidal_common::error::Result;
use tidal_common::metrics::{record_block_evicted, record_block_stored, set_memory_used};
use tidal_common::types::{BlockId, MemoryMode, StorageLevel, TaskAttemptId};

use crate::info::BlockInfoManager;
use crate::values::{BlockSerializer, BlockValue, EstimateSize};

/// Elements between reservation checks while unrolling
const UNROLL_CHECK_PERIOD: usize = 16;

/// Hands a memory-pressure victim back to the store's owner, which may spill
/// it to disk before it leaves memory. Called with the write lock on the
/// victim held; returns the block's effective level afterwards.
pub trait EvictionHandler<V>: Send + Sync {
    fn drop_from_memory(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        entry: &MemoryEntry<V>,
    ) -> Result<StorageLevel>;
}

/// Storage memory accounting capability. The accountant only tracks
/// budgets; eviction is the store's job.
pub trait MemoryAccountant: Send + Sync {
    /// Try to reserve `size` bytes; false when the pool is too full
    fn acquire(&self, size: u64, mode: MemoryMode) -> bool;
    fn release(&self, size: u64, mode: MemoryMode);
    fn max_memory(&self, mode: MemoryMode) -> u64;
    fn used(&self, mode: MemoryMode) -> u64;
    fn free(&self, mode: MemoryMode) -> u64;
}

/// Fixed-budget accountant with one pool per memory mode
pub struct StaticMemoryAccountant {
    on_heap: Pool,
    off_heap: Pool,
}

struct Pool {
    max: u64,
    used: Mutex<u64>,
}

impl Pool {
    fn new(max: u64) -> Self {
        Self {
            max,
            used: Mutex::new(0),
        }
    }
}

impl StaticMemoryAccountant {
    #[must_use]
    pub fn new(on_heap_bytes: u64, off_heap_bytes: u64) -> Self {
        Self {
            on_heap: Pool::new(on_heap_bytes),
            off_heap: Pool::new(off_heap_bytes),
        }
    }

    fn pool(&self, mode: MemoryMode) -> &Pool {
        match mode {
            MemoryMode::OnHeap => &self.on_heap,
            MemoryMode::OffHeap => &self.off_heap,
        }
    }
}

impl MemoryAccountant for StaticMemoryAccountant {
    fn acquire(&self, size: u64, mode: MemoryMode) -> bool {
        let pool = self.pool(mode);
        let mut used = pool.used.lock();
        if *used + size > pool.max {
            return false;
        }
        *used += size;
        true
    }

    fn release(&self, size: u64, mode: MemoryMode) {
        let pool = self.pool(mode);
        let mut used = pool.used.lock();
        *used = used.saturating_sub(size);
    }

    fn max_memory(&self, mode: MemoryMode) -> u64 {
        self.pool(mode).max
    }

    fn used(&self, mode: MemoryMode) -> u64 {
        *self.pool(mode).used.lock()
    }

    fn free(&self, mode: MemoryMode) -> u64 {
        let pool = self.pool(mode);
        pool.max.saturating_sub(*pool.used.lock())
    }
}

/// One resident block: typed values or serialized bytes
#[derive(Clone)]
pub enum MemoryEntry<V> {
    Values { values: Arc<Vec<V>>, size: u64 },
    Bytes { bytes: Bytes, mode: MemoryMode },
}

impl<V> MemoryEntry<V> {
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            MemoryEntry::Values { size, .. } => *size,
            MemoryEntry::Bytes { bytes, .. } => bytes.len() as u64,
        }
    }

    #[must_use]
    pub fn mode(&self) -> MemoryMode {
        match self {
            // Deserialized values only ever live on-heap
            MemoryEntry::Values { .. } => MemoryMode::OnHeap,
            MemoryEntry::Bytes { mode, .. } => *mode,
        }
    }
}

/// Resident entries in least-recently-used order (front = coldest)
struct Entries<V> {
    map: HashMap<BlockId, MemoryEntry<V>>,
    order: Vec<BlockId>,
}

impl<V> Entries<V> {
    fn new() -> Self {
        Self {
            map: HashMap::new(),
            order: Vec::new(),
        }
    }

    fn insert(&mut self, block: BlockId, entry: MemoryEntry<V>) {
        if self.map.insert(block.clone(), entry).is_none() {
            self.order.push(block);
        }
    }

    fn touch(&mut self, block: &BlockId) {
        if let Some(pos) = self.order.iter().position(|b| b == block) {
            let id = self.order.remove(pos);
            self.order.push(id);
        }
    }

    fn remove(&mut self, block: &BlockId) -> Option<MemoryEntry<V>> {
        let entry = self.map.remove(block)?;
        if let Some(pos) = self.order.iter().position(|b| b == block) {
            self.order.remove(pos);
        }
        Some(entry)
    }
}

/// Unroll reservations per task, shared with the partial iterators that
/// release them when the caller finishes draining
struct UnrollAccounting {
    accountant: Arc<dyn MemoryAccountant>,
    by_task: Mutex<HashMap<TaskAttemptId, u64>>,
}

impl UnrollAccounting {
    fn reserve(&self, task: TaskAttemptId, amount: u64, mode: MemoryMode) -> bool {
        if !self.accountant.acquire(amount, mode) {
            return false;
        }
        *self.by_task.lock().entry(task).or_insert(0) += amount;
        true
    }

    fn release(&self, task: TaskAttemptId, amount: u64, mode: MemoryMode) {
        self.accountant.release(amount, mode);
        let mut by_task = self.by_task.lock();
        if let Some(reserved) = by_task.get_mut(&task) {
            *reserved = reserved.saturating_sub(amount);
            if *reserved == 0 {
                by_task.remove(&task);
            }
        }
    }

    /// Move `amount` of the task's unroll reservation into storage
    /// accounting: the bytes stay acquired, only the bookkeeping moves.
    fn commit(&self, task: TaskAttemptId, amount: u64) {
        let mut by_task = self.by_task.lock();
        if let Some(reserved) = by_task.get_mut(&task) {
            *reserved = reserved.saturating_sub(amount);
            if *reserved == 0 {
                by_task.remove(&task);
            }
        }
    }

    fn for_task(&self, task: TaskAttemptId) -> u64 {
        self.by_task.lock().get(&task).copied().unwrap_or(0)
    }
}

/// Outcome of unrolling an iterator of values into memory
pub enum UnrollOutcome<V> {
    /// Fully admitted; the stored size in bytes
    Stored(u64),
    /// Reservation failed part-way; the iterator yields the already
    /// unrolled values followed by the untouched remainder
    NotEnoughSpace(PartiallyUnrolledIterator<V>),
}

/// Outcome of unrolling an iterator directly to serialized bytes
pub enum SerializedUnrollOutcome<V> {
    Stored(u64),
    NotEnoughSpace(PartiallySerializedValues<V>),
}

/// The in-memory tier. See the module docs for the admission contract.
pub struct MemoryStore<V: BlockValue> {
    accountant: Arc<dyn MemoryAccountant>,
    info_manager: Arc<BlockInfoManager>,
    serializer: Arc<dyn BlockSerializer<V>>,
    eviction_handler: OnceCell<Weak<dyn EvictionHandler<V>>>,
    entries: Mutex<Entries<V>>,
    unroll: Arc<UnrollAccounting>,
    initial_unroll_reservation: u64,
}

impl<V: BlockValue> MemoryStore<V> {
    #[must_use]
    pub fn new(
        accountant: Arc<dyn MemoryAccountant>,
        info_manager: Arc<BlockInfoManager>,
        serializer: Arc<dyn BlockSerializer<V>>,
        initial_unroll_reservation: u64,
    ) -> Self {
        Self {
            accountant: Arc::clone(&accountant),
            info_manager,
            serializer,
            eviction_handler: OnceCell::new(),
            entries: Mutex::new(Entries::new()),
            unroll: Arc::new(UnrollAccounting {
                accountant,
                by_task: Mutex::new(HashMap::new()),
            }),
            initial_unroll_reservation,
        }
    }

    /// Attach the owner's eviction callback. Weak so the back-edge to the
    /// owner does not form a cycle.
    pub fn attach_eviction_handler(&self, handler: Weak<dyn EvictionHandler<V>>) {
        let _ = self.eviction_handler.set(handler);
    }

    /// Store a block of known size. The reservation is taken first and
    /// `materialize` runs only if it succeeded, so an oversize block never
    /// allocates. Returns `false` on reservation failure.
    pub fn put_bytes<F>(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        size: u64,
        mode: MemoryMode,
        materialize: F,
    ) -> Result<bool>
    where
        F: FnOnce() -> Result<Bytes>,
    {
        if !self.reserve_storage(task, block, size, mode) {
            return Ok(false);
        }

        let bytes = match materialize() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.accountant.release(size, mode);
                return Err(e);
            }
        };
        if bytes.len() as u64 != size {
            warn!(
                "Block {} materialized {} bytes but reserved {}",
                block,
                bytes.len(),
                size
            );
        }

        self.entries
            .lock()
            .insert(block.clone(), MemoryEntry::Bytes { bytes, mode });
        record_block_stored("memory", size);
        self.update_memory_gauge(mode);
        debug!(
            "Block {} stored as {} bytes in memory ({} free)",
            block,
            size,
            self.accountant.free(mode)
        );
        Ok(true)
    }

    /// Unroll an iterator of values into memory, growing the reservation as
    /// the estimate grows. On failure the returned iterator owns what was
    /// unrolled and releases its reservation once drained or dropped.
    pub fn put_iterator_as_values(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        mut values: Box<dyn Iterator<Item = V> + Send>,
    ) -> Result<UnrollOutcome<V>> {
        let mode = MemoryMode::OnHeap;
        let mut reserved = self.initial_unroll_reservation;
        if !self.reserve_unroll(task, block, reserved, mode) {
            return Ok(UnrollOutcome::NotEnoughSpace(PartiallyUnrolledIterator {
                unrolled: Vec::new().into_iter(),
                rest: values,
                unroll: Arc::clone(&self.unroll),
                task,
                mode,
                remaining_reservation: 0,
            }));
        }

        let mut unrolled: Vec<V> = Vec::new();
        let mut estimated: u64 = 0;
        while let Some(value) = values.next() {
            estimated += value.estimated_size() as u64;
            unrolled.push(value);

            if unrolled.len() % UNROLL_CHECK_PERIOD == 0 && estimated > reserved {
                // Grow geometrically so large blocks do not re-reserve per element
                let request = estimated + estimated / 2 - reserved;
                if self.reserve_unroll(task, block, request, mode) {
                    reserved += request;
                } else {
                    debug!(
                        "Not enough memory to unroll block {} ({} values, ~{} bytes)",
                        block,
                        unrolled.len(),
                        estimated
                    );
                    return Ok(UnrollOutcome::NotEnoughSpace(PartiallyUnrolledIterator {
                        unrolled: unrolled.into_iter(),
                        rest: values,
                        unroll: Arc::clone(&self.unroll),
                        task,
                        mode,
                        remaining_reservation: reserved,
                    }));
                }
            }
        }

        let size = estimated.max(1);
        if size > reserved {
            let request = size - reserved;
            if self.reserve_unroll(task, block, request, mode) {
                reserved += request;
            } else {
                return Ok(UnrollOutcome::NotEnoughSpace(PartiallyUnrolledIterator {
                    unrolled: unrolled.into_iter(),
                    rest: values,
                    unroll: Arc::clone(&self.unroll),
                    task,
                    mode,
                    remaining_reservation: reserved,
                }));
            }
        }

        // Commit: `size` becomes storage accounting, the excess goes back
        self.unroll.commit(task, size);
        if reserved > size {
            self.unroll.release(task, reserved - size, mode);
        }
        self.entries.lock().insert(
            block.clone(),
            MemoryEntry::Values {
                values: Arc::new(unrolled),
                size,
            },
        );
        record_block_stored("memory", size);
        self.update_memory_gauge(mode);
        Ok(UnrollOutcome::Stored(size))
    }

    /// Unroll an iterator of values into serialized bytes, reserving as the
    /// buffer grows
    pub fn put_iterator_as_bytes(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        mut values: Box<dyn Iterator<Item = V> + Send>,
        mode: MemoryMode,
    ) -> Result<SerializedUnrollOutcome<V>> {
        let mut reserved = self.initial_unroll_reservation;
        if !self.reserve_unroll(task, block, reserved, mode) {
            return Ok(SerializedUnrollOutcome::NotEnoughSpace(
                PartiallySerializedValues {
                    buffered: Vec::new(),
                    rest: values,
                    serializer: Arc::clone(&self.serializer),
                    unroll: Arc::clone(&self.unroll),
                    task,
                    mode,
                    remaining_reservation: 0,
                },
            ));
        }

        let mut buffer: Vec<u8> = Vec::new();
        let mut count = 0usize;
        while let Some(value) = values.next() {
            self.serializer.serialize_one(&value, &mut buffer)?;
            count += 1;

            if count % UNROLL_CHECK_PERIOD == 0 && buffer.len() as u64 > reserved {
                let needed = buffer.len() as u64;
                let request = needed + needed / 2 - reserved;
                if self.reserve_unroll(task, block, request, mode) {
                    reserved += request;
                } else {
                    debug!(
                        "Not enough memory to serialize block {} in memory ({} bytes so far)",
                        block,
                        buffer.len()
                    );
                    return Ok(SerializedUnrollOutcome::NotEnoughSpace(
                        PartiallySerializedValues {
                            buffered: buffer,
                            rest: values,
                            serializer: Arc::clone(&self.serializer),
                            unroll: Arc::clone(&self.unroll),
                            task,
                            mode,
                            remaining_reservation: reserved,
                        },
                    ));
                }
            }
        }

        let size = buffer.len().max(1) as u64;
        if size > reserved {
            let request = size - reserved;
            if self.reserve_unroll(task, block, request, mode) {
                reserved += request;
            } else {
                return Ok(SerializedUnrollOutcome::NotEnoughSpace(
                    PartiallySerializedValues {
                        buffered: buffer,
                        rest: values,
                        serializer: Arc::clone(&self.serializer),
                        unroll: Arc::clone(&self.unroll),
                        task,
                        mode,
                        remaining_reservation: reserved,
                    },
                ));
            }
        }

        self.unroll.commit(task, size);
        if reserved > size {
            self.unroll.release(task, reserved - size, mode);
        }
        self.entries.lock().insert(
            block.clone(),
            MemoryEntry::Bytes {
                bytes: Bytes::from(buffer),
                mode,
            },
        );
        record_block_stored("memory", size);
        self.update_memory_gauge(mode);
        Ok(SerializedUnrollOutcome::Stored(size))
    }

    /// The typed values of a resident deserialized block
    #[must_use]
    pub fn get_values(&self, block: &BlockId) -> Option<Arc<Vec<V>>> {
        let mut entries = self.entries.lock();
        match entries.map.get(block) {
            Some(MemoryEntry::Values { values, .. }) => {
                let values = Arc::clone(values);
                entries.touch(block);
                Some(values)
            }
            _ => None,
        }
    }

    /// The serialized bytes of a resident serialized block
    #[must_use]
    pub fn get_bytes(&self, block: &BlockId) -> Option<Bytes> {
        let mut entries = self.entries.lock();
        match entries.map.get(block) {
            Some(MemoryEntry::Bytes { bytes, .. }) => {
                let bytes = bytes.clone();
                entries.touch(block);
                Some(bytes)
            }
            _ => None,
        }
    }

    #[must_use]
    pub fn contains(&self, block: &BlockId) -> bool {
        self.entries.lock().map.contains_key(block)
    }

    #[must_use]
    pub fn get_size(&self, block: &BlockId) -> Option<u64> {
        self.entries.lock().map.get(block).map(MemoryEntry::size)
    }

    /// Drop the block from memory and give its reservation back
    pub fn remove(&self, block: &BlockId) -> bool {
        let removed = self.entries.lock().remove(block);
        match removed {
            Some(entry) => {
                let mode = entry.mode();
                self.accountant.release(entry.size(), mode);
                self.update_memory_gauge(mode);
                true
            }
            None => false,
        }
    }

    /// Total bytes resident in one pool
    #[must_use]
    pub fn memory_used(&self, mode: MemoryMode) -> u64 {
        self.accountant.used(mode)
    }

    /// Unroll reservation currently held by a task
    #[must_use]
    pub fn unroll_memory_for_task(&self, task: TaskAttemptId) -> u64 {
        self.unroll.for_task(task)
    }

    /// Free everything a finished task still has reserved for unrolling
    pub fn release_unroll_memory_for_task(&self, task: TaskAttemptId) {
        let amount = self.unroll.for_task(task);
        if amount > 0 {
            self.unroll.release(task, amount, MemoryMode::OnHeap);
        }
    }

    fn update_memory_gauge(&self, mode: MemoryMode) {
        let label = match mode {
            MemoryMode::OnHeap => "on_heap",
            MemoryMode::OffHeap => "off_heap",
        };
        set_memory_used(label, self.accountant.used(mode));
    }

    fn reserve_storage(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        size: u64,
        mode: MemoryMode,
    ) -> bool {
        if self.accountant.acquire(size, mode) {
            return true;
        }
        if !self.evict_blocks_to_free_space(task, Some(block), size, mode) {
            return false;
        }
        self.accountant.acquire(size, mode)
    }

    fn reserve_unroll(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        amount: u64,
        mode: MemoryMode,
    ) -> bool {
        if self.unroll.reserve(task, amount, mode) {
            return true;
        }
        if !self.evict_blocks_to_free_space(task, Some(block), amount, mode) {
            return false;
        }
        self.unroll.reserve(task, amount, mode)
    }

    /// Evict cold blocks until `space_needed` bytes could be reserved.
    /// Never evicts the incoming block, a block of the incoming block's
    /// dataset, or a block someone holds a lock on. Returns whether enough
    /// space was freed.
    fn evict_blocks_to_free_space(
        &self,
        task: TaskAttemptId,
        incoming: Option<&BlockId>,
        space_needed: u64,
        mode: MemoryMode,
    ) -> bool {
        let incoming_rdd = incoming.and_then(BlockId::rdd_id);
        let mut selected: Vec<BlockId> = Vec::new();
        let mut freeable: u64 = 0;

        {
            let entries = self.entries.lock();
            for candidate in &entries.order {
                if self.accountant.free(mode) + freeable >= space_needed {
                    break;
                }
                let Some(entry) = entries.map.get(candidate) else {
                    continue;
                };
                if entry.mode() != mode {
                    continue;
                }
                if incoming == Some(candidate) {
                    continue;
                }
                if incoming_rdd.is_some() && candidate.rdd_id() == incoming_rdd {
                    continue;
                }
                // Write-lock the victim; skip anything in use
                if self
                    .info_manager
                    .lock_for_writing(task, candidate, false)
                    .is_some()
                {
                    freeable += entry.size();
                    selected.push(candidate.clone());
                }
            }
        }

        if self.accountant.free(mode) + freeable < space_needed {
            for victim in &selected {
                let _ = self.info_manager.unlock(task, victim);
            }
            return false;
        }

        let Some(handler) = self.eviction_handler.get().and_then(Weak::upgrade) else {
            for victim in &selected {
                let _ = self.info_manager.unlock(task, victim);
            }
            return false;
        };

        debug!(
            "Evicting {} blocks to free {} bytes",
            selected.len(),
            space_needed
        );
        for victim in selected {
            let entry = self.entries.lock().map.get(&victim).cloned();
            let Some(entry) = entry else {
                let _ = self.info_manager.unlock(task, &victim);
                continue;
            };
            match handler.drop_from_memory(task, &victim, &entry) {
                Ok(new_level) => {
                    record_block_evicted(new_level.use_disk);
                    if new_level.is_valid() {
                        let _ = self.info_manager.unlock(task, &victim);
                    } else {
                        let _ = self.info_manager.remove_block(task, &victim);
                    }
                }
                Err(e) => {
                    warn!("Failed to drop block {} from memory: {}", victim, e);
                    let _ = self.info_manager.unlock(task, &victim);
                }
            }
        }
        true
    }
}

/// Iterator over a block that did not fit in memory: yields the values that
/// were unrolled, then the untouched remainder of the source. The unroll
/// reservation is released as soon as the unrolled prefix is drained, and at
/// the latest on drop.
pub struct PartiallyUnrolledIterator<V> {
    unrolled: std::vec::IntoIter<V>,
    rest: Box<dyn Iterator<Item = V> + Send>,
    unroll: Arc<UnrollAccounting>,
    task: TaskAttemptId,
    mode: MemoryMode,
    remaining_reservation: u64,
}

impl<V> PartiallyUnrolledIterator<V> {
    fn release_reservation(&mut self) {
        if self.remaining_reservation > 0 {
            self.unroll
                .release(self.task, self.remaining_reservation, self.mode);
            self.remaining_reservation = 0;
        }
    }
}

impl<V> Iterator for PartiallyUnrolledIterator<V> {
    type Item = V;

    fn next(&mut self) -> Option<V> {
        if let Some(value) = self.unrolled.next() {
            return Some(value);
        }
        self.release_reservation();
        self.rest.next()
    }
}

impl<V> Drop for PartiallyUnrolledIterator<V> {
    fn drop(&mut self) {
        self.release_reservation();
    }
}

/// A block that was being serialized into memory when the reservation ran
/// out. The buffered prefix is already serialized; the remainder is still
/// typed values.
pub struct PartiallySerializedValues<V> {
    buffered: Vec<u8>,
    rest: Box<dyn Iterator<Item = V> + Send>,
    serializer: Arc<dyn BlockSerializer<V>>,
    unroll: Arc<UnrollAccounting>,
    task: TaskAttemptId,
    mode: MemoryMode,
    remaining_reservation: u64,
}

impl<V: BlockValue> PartiallySerializedValues<V> {
    /// Finish serializing everything into `out`: first the buffered prefix,
    /// then the remaining values
    pub fn finish_writing_to_stream(mut self, out: &mut dyn std::io::Write) -> Result<()> {
        out.write_all(&self.buffered)
            .map_err(tidal_common::error::Error::Io)?;
        let mut rest = std::mem::replace(
            &mut self.rest,
            Box::new(std::iter::empty()) as Box<dyn Iterator<Item = V> + Send>,
        );
        self.serializer.serialize_stream(&mut rest, out)?;
        Ok(())
    }

    /// Turn the partial state back into a value iterator, deserializing the
    /// buffered prefix
    pub fn into_values_iterator(mut self) -> Result<Box<dyn Iterator<Item = V> + Send>> {
        let prefix = self
            .serializer
            .deserialize_all(&mut self.buffered.as_slice())?;
        let rest = std::mem::replace(
            &mut self.rest,
            Box::new(std::iter::empty()) as Box<dyn Iterator<Item = V> + Send>,
        );
        Ok(Box::new(prefix.into_iter().chain(rest)))
    }
}

impl<V> Drop for PartiallySerializedValues<V> {
    fn drop(&mut self) {
        if self.remaining_reservation > 0 {
            self.unroll
                .release(self.task, self.remaining_reservation, self.mode);
            self.remaining_reservation = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tidal_common::types::NON_TASK_WRITER;

    use crate::info::BlockInfo;
    use crate::values::JsonSerializer;

    type Store = MemoryStore<u64>;

    fn rdd(rdd_id: u32, split: u32) -> BlockId {
        BlockId::Rdd {
            rdd_id,
            split_index: split,
        }
    }

    fn new_store(budget: u64) -> (Arc<Store>, Arc<BlockInfoManager>) {
        let info_manager = Arc::new(BlockInfoManager::new());
        let store = Arc::new(MemoryStore::new(
            Arc::new(StaticMemoryAccountant::new(budget, 0)),
            Arc::clone(&info_manager),
            Arc::new(JsonSerializer),
            16,
        ));
        (store, info_manager)
    }

    /// Eviction handler that just drops victims from memory, like a
    /// memory-only level would
    struct DropOnly {
        store: Arc<Store>,
        dropped: Mutex<Vec<BlockId>>,
    }

    impl EvictionHandler<u64> for DropOnly {
        fn drop_from_memory(
            &self,
            _task: TaskAttemptId,
            block: &BlockId,
            _entry: &MemoryEntry<u64>,
        ) -> Result<StorageLevel> {
            self.store.remove(block);
            self.dropped.lock().push(block.clone());
            Ok(StorageLevel::NONE)
        }
    }

    fn with_handler(store: &Arc<Store>) -> Arc<DropOnly> {
        let handler = Arc::new(DropOnly {
            store: Arc::clone(store),
            dropped: Mutex::new(Vec::new()),
        });
        let weak: Weak<dyn EvictionHandler<u64>> =
            Arc::downgrade(&handler) as Weak<dyn EvictionHandler<u64>>;
        store.attach_eviction_handler(weak);
        handler
    }

    /// Register a block and leave it unlocked, the state a committed put
    /// leaves behind
    fn register_unlocked(info_manager: &BlockInfoManager, block: &BlockId) {
        assert!(info_manager.lock_new_block_for_writing(
            NON_TASK_WRITER,
            block,
            BlockInfo::new(StorageLevel::MEMORY_ONLY, "test", true),
        ));
        info_manager.unlock(NON_TASK_WRITER, block).unwrap();
    }

    fn put_resident(store: &Store, info_manager: &BlockInfoManager, block: &BlockId, size: u64) {
        register_unlocked(info_manager, block);
        let stored = store
            .put_bytes(NON_TASK_WRITER, block, size, MemoryMode::OnHeap, || {
                Ok(Bytes::from(vec![0u8; size as usize]))
            })
            .unwrap();
        assert!(stored);
    }

    #[test]
    fn put_bytes_stores_and_reads_back() {
        let (store, info_manager) = new_store(100);
        let block = rdd(1, 0);
        register_unlocked(&info_manager, &block);

        let stored = store
            .put_bytes(NON_TASK_WRITER, &block, 3, MemoryMode::OnHeap, || {
                Ok(Bytes::from_static(&[1, 2, 3]))
            })
            .unwrap();
        assert!(stored);
        assert!(store.contains(&block));
        assert_eq!(store.get_size(&block), Some(3));
        assert_eq!(store.get_bytes(&block).unwrap(), Bytes::from_static(&[1, 2, 3]));
        assert_eq!(store.memory_used(MemoryMode::OnHeap), 3);
    }

    #[test]
    fn reservation_failure_never_materializes() {
        let (store, info_manager) = new_store(10);
        let block = rdd(1, 0);
        register_unlocked(&info_manager, &block);

        let mut invoked = false;
        let stored = store
            .put_bytes(NON_TASK_WRITER, &block, 100, MemoryMode::OnHeap, || {
                invoked = true;
                Ok(Bytes::new())
            })
            .unwrap();
        assert!(!stored);
        assert!(!invoked, "materializer must not run on reservation failure");
        assert_eq!(store.memory_used(MemoryMode::OnHeap), 0);
    }

    #[test]
    fn materialization_error_releases_reservation() {
        let (store, info_manager) = new_store(10);
        let block = rdd(1, 0);
        register_unlocked(&info_manager, &block);

        let result = store.put_bytes(NON_TASK_WRITER, &block, 10, MemoryMode::OnHeap, || {
            Err(tidal_common::error::Error::Internal("disk on fire".into()))
        });
        assert!(result.is_err());
        assert_eq!(store.memory_used(MemoryMode::OnHeap), 0);
        assert!(!store.contains(&block));
    }

    #[test]
    fn eviction_frees_space_for_new_blocks() {
        let (store, info_manager) = new_store(10);
        let handler = with_handler(&store);

        put_resident(&store, &info_manager, &rdd(1, 0), 8);

        let newcomer = rdd(2, 0);
        register_unlocked(&info_manager, &newcomer);
        let stored = store
            .put_bytes(NON_TASK_WRITER, &newcomer, 8, MemoryMode::OnHeap, || {
                Ok(Bytes::from(vec![7u8; 8]))
            })
            .unwrap();

        assert!(stored);
        assert_eq!(*handler.dropped.lock(), vec![rdd(1, 0)]);
        assert!(!store.contains(&rdd(1, 0)));
        assert!(store.contains(&newcomer));
    }

    #[test]
    fn eviction_skips_blocks_of_the_same_dataset() {
        let (store, info_manager) = new_store(10);
        let handler = with_handler(&store);

        put_resident(&store, &info_manager, &rdd(1, 0), 8);

        // A sibling partition must not evict its own dataset
        let sibling = rdd(1, 1);
        register_unlocked(&info_manager, &sibling);
        let stored = store
            .put_bytes(NON_TASK_WRITER, &sibling, 8, MemoryMode::OnHeap, || {
                Ok(Bytes::from(vec![7u8; 8]))
            })
            .unwrap();
        assert!(!stored);
        assert!(handler.dropped.lock().is_empty());
        assert!(store.contains(&rdd(1, 0)));

        // A foreign dataset may
        let foreign = rdd(2, 0);
        register_unlocked(&info_manager, &foreign);
        let stored = store
            .put_bytes(NON_TASK_WRITER, &foreign, 8, MemoryMode::OnHeap, || {
                Ok(Bytes::from(vec![9u8; 8]))
            })
            .unwrap();
        assert!(stored);
        assert_eq!(*handler.dropped.lock(), vec![rdd(1, 0)]);
    }

    #[test]
    fn eviction_skips_locked_blocks() {
        let (store, info_manager) = new_store(10);
        let _handler = with_handler(&store);

        put_resident(&store, &info_manager, &rdd(1, 0), 8);
        // A reader pins the only candidate
        info_manager.lock_for_reading(7, &rdd(1, 0), true).unwrap();

        let newcomer = rdd(2, 0);
        register_unlocked(&info_manager, &newcomer);
        let stored = store
            .put_bytes(NON_TASK_WRITER, &newcomer, 8, MemoryMode::OnHeap, || {
                Ok(Bytes::from(vec![7u8; 8]))
            })
            .unwrap();
        assert!(!stored);
        assert!(store.contains(&rdd(1, 0)));
    }

    #[test]
    fn evicts_oldest_blocks_first() {
        let (store, info_manager) = new_store(12);
        let handler = with_handler(&store);

        put_resident(&store, &info_manager, &rdd(1, 0), 4);
        put_resident(&store, &info_manager, &rdd(2, 0), 4);
        put_resident(&store, &info_manager, &rdd(3, 0), 4);

        // Touch the oldest so it becomes the hottest
        let _ = store.get_bytes(&rdd(1, 0));

        let newcomer = rdd(4, 0);
        register_unlocked(&info_manager, &newcomer);
        let stored = store
            .put_bytes(NON_TASK_WRITER, &newcomer, 4, MemoryMode::OnHeap, || {
                Ok(Bytes::from(vec![1u8; 4]))
            })
            .unwrap();
        assert!(stored);
        assert_eq!(*handler.dropped.lock(), vec![rdd(2, 0)]);
    }

    #[test]
    fn unroll_stores_small_iterators() {
        let (store, _info) = new_store(10_000);
        let block = rdd(1, 0);
        let values: Vec<u64> = (0..100).collect();

        let outcome = store
            .put_iterator_as_values(1, &block, Box::new(values.clone().into_iter()))
            .unwrap();
        match outcome {
            UnrollOutcome::Stored(size) => assert!(size >= 800),
            UnrollOutcome::NotEnoughSpace(_) => panic!("expected the block to fit"),
        }
        assert_eq!(*store.get_values(&block).unwrap(), values);
        assert_eq!(store.unroll_memory_for_task(1), 0);
    }

    #[test]
    fn unroll_failure_returns_all_values_and_releases_memory() {
        let (store, _info) = new_store(100);
        let block = rdd(1, 0);
        let values: Vec<u64> = (0..1000).collect();

        let outcome = store
            .put_iterator_as_values(1, &block, Box::new(values.clone().into_iter()))
            .unwrap();
        let partial = match outcome {
            UnrollOutcome::Stored(_) => panic!("1000 u64s cannot fit in 100 bytes"),
            UnrollOutcome::NotEnoughSpace(partial) => partial,
        };
        assert!(!store.contains(&block));

        let recovered: Vec<u64> = partial.collect();
        assert_eq!(recovered, values);
        assert_eq!(store.unroll_memory_for_task(1), 0);
        assert_eq!(store.memory_used(MemoryMode::OnHeap), 0);
    }

    #[test]
    fn dropping_partial_iterator_releases_memory() {
        let (store, _info) = new_store(100);
        let values: Vec<u64> = (0..1000).collect();

        let outcome = store
            .put_iterator_as_values(1, &rdd(1, 0), Box::new(values.into_iter()))
            .unwrap();
        match outcome {
            UnrollOutcome::Stored(_) => panic!("must not fit"),
            UnrollOutcome::NotEnoughSpace(partial) => drop(partial),
        }
        assert_eq!(store.memory_used(MemoryMode::OnHeap), 0);
        assert_eq!(store.unroll_memory_for_task(1), 0);
    }

    #[test]
    fn serialized_unroll_round_trips() {
        let (store, _info) = new_store(100_000);
        let block = rdd(1, 0);
        let values: Vec<u64> = (0..50).collect();

        let outcome = store
            .put_iterator_as_bytes(
                1,
                &block,
                Box::new(values.clone().into_iter()),
                MemoryMode::OnHeap,
            )
            .unwrap();
        let size = match outcome {
            SerializedUnrollOutcome::Stored(size) => size,
            SerializedUnrollOutcome::NotEnoughSpace(_) => panic!("expected fit"),
        };
        let bytes = store.get_bytes(&block).unwrap();
        assert_eq!(bytes.len() as u64, size);

        let serializer = JsonSerializer;
        let read: Vec<u64> =
            BlockSerializer::<u64>::deserialize_all(&serializer, &mut bytes.as_ref()).unwrap();
        assert_eq!(read, values);
    }

    #[test]
    fn partially_serialized_finishes_to_a_complete_stream() {
        let (store, _info) = new_store(64);
        let block = rdd(1, 0);
        let values: Vec<u64> = (0..500).collect();

        let outcome = store
            .put_iterator_as_bytes(
                1,
                &block,
                Box::new(values.clone().into_iter()),
                MemoryMode::OnHeap,
            )
            .unwrap();
        let partial = match outcome {
            SerializedUnrollOutcome::Stored(_) => panic!("500 values cannot fit in 64 bytes"),
            SerializedUnrollOutcome::NotEnoughSpace(partial) => partial,
        };

        let mut out = Vec::new();
        partial.finish_writing_to_stream(&mut out).unwrap();
        assert_eq!(store.memory_used(MemoryMode::OnHeap), 0);

        let serializer = JsonSerializer;
        let read: Vec<u64> =
            BlockSerializer::<u64>::deserialize_all(&serializer, &mut out.as_slice()).unwrap();
        assert_eq!(read, values);
    }

    #[test]
    fn partially_serialized_recovers_values() {
        let (store, _info) = new_store(64);
        let values: Vec<u64> = (0..500).collect();

        let outcome = store
            .put_iterator_as_bytes(
                1,
                &rdd(1, 0),
                Box::new(values.clone().into_iter()),
                MemoryMode::OnHeap,
            )
            .unwrap();
        let partial = match outcome {
            SerializedUnrollOutcome::Stored(_) => panic!("must not fit"),
            SerializedUnrollOutcome::NotEnoughSpace(partial) => partial,
        };

        let recovered: Vec<u64> = partial.into_values_iterator().unwrap().collect();
        assert_eq!(recovered, values);
        assert_eq!(store.memory_used(MemoryMode::OnHeap), 0);
    }

    #[test]
    fn remove_releases_reservation() {
        let (store, info_manager) = new_store(10);
        put_resident(&store, &info_manager, &rdd(1, 0), 8);
        assert_eq!(store.memory_used(MemoryMode::OnHeap), 8);

        assert!(store.remove(&rdd(1, 0)));
        assert_eq!(store.memory_used(MemoryMode::OnHeap), 0);
        assert!(!store.remove(&rdd(1, 0)));
    }
}
