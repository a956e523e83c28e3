//! Per-block metadata and locking
//!
//! Every block's metadata lives here, guarded by a multi-reader /
//! single-writer lock keyed by block id. Lock ownership is tracked per task
//! so that task termination can release everything the task still holds.

use std::collections::{HashMap, HashSet};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use tidal_common::error::{Error, Result, StorageError};
use tidal_common::types::{BlockId, StorageLevel, TaskAttemptId};

/// Metadata for one block. The `reader_count`/`writer_task` fields are
/// owned by the [`BlockInfoManager`]; callers only ever see snapshots.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    /// The level the block was requested to be stored at
    pub level: StorageLevel,
    /// Type tag handed to the serializer when the block moves between forms
    pub type_tag: String,
    /// Whether placement changes are reported to the master. Suppressed for
    /// broadcast-style blocks.
    pub tell_master: bool,
    /// Size in bytes, set once placement succeeds
    pub size: u64,
    reader_count: u32,
    writer_task: Option<TaskAttemptId>,
}

impl BlockInfo {
    #[must_use]
    pub fn new(level: StorageLevel, type_tag: impl Into<String>, tell_master: bool) -> Self {
        Self {
            level,
            type_tag: type_tag.into(),
            tell_master,
            size: 0,
            reader_count: 0,
            writer_task: None,
        }
    }

    /// Number of read locks currently held on the block
    #[must_use]
    pub fn reader_count(&self) -> u32 {
        self.reader_count
    }

    /// The task holding the write lock, if any
    #[must_use]
    pub fn writer_task(&self) -> Option<TaskAttemptId> {
        self.writer_task
    }
}

#[derive(Default)]
struct State {
    infos: HashMap<BlockId, BlockInfo>,
    /// Read locks held per task; a task may hold several on the same block,
    /// so this is a multiset kept as a list
    read_locks_by_task: HashMap<TaskAttemptId, Vec<BlockId>>,
    write_locks_by_task: HashMap<TaskAttemptId, HashSet<BlockId>>,
}

/// Lock manager for all block metadata on this node.
///
/// One monitor guards everything; waiting acquisitions park on a single
/// condition variable and re-check after every release. Fairness is not
/// guaranteed. Invariant, for any block: either readers > 0 and no writer,
/// or one writer and zero readers, or neither.
#[derive(Default)]
pub struct BlockInfoManager {
    state: Mutex<State>,
    cond: Condvar,
}

impl BlockInfoManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire a read lock. Returns `None` when the block does not exist, or
    /// when a writer holds it and `blocking` is false. Otherwise waits for
    /// the writer to release.
    pub fn lock_for_reading(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        blocking: bool,
    ) -> Option<BlockInfo> {
        trace!("Task {} trying to acquire read lock for {}", task, block);
        let mut state = self.state.lock();
        loop {
            let writer_busy = match state.infos.get(block) {
                None => return None,
                Some(info) => info.writer_task.is_some(),
            };
            if !writer_busy {
                let info = state
                    .infos
                    .get_mut(block)
                    .expect("checked above while holding the monitor");
                info.reader_count += 1;
                let snapshot = info.clone();
                state
                    .read_locks_by_task
                    .entry(task)
                    .or_default()
                    .push(block.clone());
                return Some(snapshot);
            }
            if !blocking {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Acquire the write lock. Requires zero readers and no writer; returns
    /// `None` when the block does not exist, or when the lock is busy and
    /// `blocking` is false.
    pub fn lock_for_writing(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        blocking: bool,
    ) -> Option<BlockInfo> {
        trace!("Task {} trying to acquire write lock for {}", task, block);
        let mut state = self.state.lock();
        loop {
            let busy = match state.infos.get(block) {
                None => return None,
                Some(info) => info.writer_task.is_some() || info.reader_count > 0,
            };
            if !busy {
                let info = state
                    .infos
                    .get_mut(block)
                    .expect("checked above while holding the monitor");
                info.writer_task = Some(task);
                let snapshot = info.clone();
                state
                    .write_locks_by_task
                    .entry(task)
                    .or_default()
                    .insert(block.clone());
                return Some(snapshot);
            }
            if !blocking {
                return None;
            }
            self.cond.wait(&mut state);
        }
    }

    /// Insert `info` and acquire the write lock on it if the block is
    /// absent, returning `true`. If the block already exists, acquire a read
    /// lock on the existing entry instead and return `false`.
    pub fn lock_new_block_for_writing(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
        new_info: BlockInfo,
    ) -> bool {
        enum Existing {
            Absent,
            Readable,
            WriterBusy,
        }

        let mut state = self.state.lock();
        let mut pending = Some(new_info);
        loop {
            let existing = match state.infos.get(block) {
                None => Existing::Absent,
                Some(info) if info.writer_task.is_none() => Existing::Readable,
                Some(_) => Existing::WriterBusy,
            };
            match existing {
                Existing::Absent => {
                    let mut info = pending.take().expect("insert attempted once");
                    info.writer_task = Some(task);
                    info.reader_count = 0;
                    state.infos.insert(block.clone(), info);
                    state
                        .write_locks_by_task
                        .entry(task)
                        .or_default()
                        .insert(block.clone());
                    return true;
                }
                Existing::Readable => {
                    let info = state
                        .infos
                        .get_mut(block)
                        .expect("checked above while holding the monitor");
                    info.reader_count += 1;
                    state
                        .read_locks_by_task
                        .entry(task)
                        .or_default()
                        .push(block.clone());
                    return false;
                }
                Existing::WriterBusy => {
                    // Another task is writing this block; wait and re-check.
                    // It may commit (read-lock path) or abort (insert path).
                    self.cond.wait(&mut state);
                }
            }
        }
    }

    /// Release one lock held by `task` on `block`: the write lock if the
    /// task holds it, otherwise one read lock.
    pub fn unlock(&self, task: TaskAttemptId, block: &BlockId) -> Result<()> {
        let mut state = self.state.lock();
        let is_writer = match state.infos.get(block) {
            None => {
                return Err(Error::Storage(StorageError::BlockNotFound(
                    block.to_string(),
                )))
            }
            Some(info) => info.writer_task == Some(task),
        };

        if is_writer {
            if let Some(info) = state.infos.get_mut(block) {
                info.writer_task = None;
            }
            if let Some(blocks) = state.write_locks_by_task.get_mut(&task) {
                blocks.remove(block);
            }
        } else {
            // Only a lock this task recorded may be released; a stale
            // release must not steal another task's read lock
            let position = state
                .read_locks_by_task
                .get(&task)
                .and_then(|blocks| blocks.iter().position(|b| b == block));
            let Some(position) = position else {
                return Err(Error::Internal(format!(
                    "Task {task} released a lock on {block} it does not hold"
                )));
            };
            if let Some(blocks) = state.read_locks_by_task.get_mut(&task) {
                blocks.swap_remove(position);
            }
            if let Some(info) = state.infos.get_mut(block) {
                debug_assert!(info.reader_count > 0);
                info.reader_count = info.reader_count.saturating_sub(1);
            }
        }
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Atomically turn the write lock `task` holds on `block` into a read
    /// lock. No other writer can interpose.
    pub fn downgrade_lock(&self, task: TaskAttemptId, block: &BlockId) -> Result<()> {
        let mut state = self.state.lock();
        let info = state
            .infos
            .get_mut(block)
            .ok_or_else(|| Error::Storage(StorageError::BlockNotFound(block.to_string())))?;

        if info.writer_task != Some(task) {
            return Err(Error::Storage(StorageError::NotLockedForWriting(
                block.to_string(),
            )));
        }
        info.writer_task = None;
        info.reader_count += 1;
        if let Some(blocks) = state.write_locks_by_task.get_mut(&task) {
            blocks.remove(block);
        }
        state
            .read_locks_by_task
            .entry(task)
            .or_default()
            .push(block.clone());
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Release every lock `task` still holds. Called at task boundaries so
    /// leaked locks cannot outlive their task. Returns the blocks touched.
    pub fn release_all_locks_for_task(&self, task: TaskAttemptId) -> Vec<BlockId> {
        let mut state = self.state.lock();
        let mut released = Vec::new();

        if let Some(write_blocks) = state.write_locks_by_task.remove(&task) {
            for block in write_blocks {
                if let Some(info) = state.infos.get_mut(&block) {
                    if info.writer_task == Some(task) {
                        info.writer_task = None;
                    }
                }
                released.push(block);
            }
        }

        if let Some(read_blocks) = state.read_locks_by_task.remove(&task) {
            for block in read_blocks {
                if let Some(info) = state.infos.get_mut(&block) {
                    if info.reader_count > 0 {
                        info.reader_count -= 1;
                    }
                }
                released.push(block);
            }
        }

        drop(state);
        self.cond.notify_all();

        if !released.is_empty() {
            debug!("Released {} locks for task {}", released.len(), task);
        }
        let mut seen = HashSet::new();
        released.retain(|b| seen.insert(b.clone()));
        released
    }

    /// Erase the entry for `block`. The caller must hold the write lock;
    /// every waiter is woken and observes the absence.
    pub fn remove_block(&self, task: TaskAttemptId, block: &BlockId) -> Result<()> {
        let mut state = self.state.lock();
        let info = state
            .infos
            .get(block)
            .ok_or_else(|| Error::Storage(StorageError::BlockNotFound(block.to_string())))?;
        if info.writer_task != Some(task) {
            return Err(Error::Storage(StorageError::NotLockedForWriting(
                block.to_string(),
            )));
        }
        state.infos.remove(block);
        if let Some(blocks) = state.write_locks_by_task.get_mut(&task) {
            blocks.remove(block);
        }
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Snapshot the info of a block the caller claims to hold the write
    /// lock on; errors otherwise. Invariant check for internal callers.
    pub fn assert_block_is_locked_for_writing(
        &self,
        task: TaskAttemptId,
        block: &BlockId,
    ) -> Result<BlockInfo> {
        let state = self.state.lock();
        match state.infos.get(block) {
            Some(info) if info.writer_task == Some(task) => Ok(info.clone()),
            Some(_) | None => Err(Error::Storage(StorageError::NotLockedForWriting(
                block.to_string(),
            ))),
        }
    }

    /// Record the size of a block; requires the write lock
    pub fn set_size(&self, task: TaskAttemptId, block: &BlockId, size: u64) -> Result<()> {
        let mut state = self.state.lock();
        match state.infos.get_mut(block) {
            Some(info) if info.writer_task == Some(task) => {
                info.size = size;
                Ok(())
            }
            Some(_) | None => Err(Error::Storage(StorageError::NotLockedForWriting(
                block.to_string(),
            ))),
        }
    }

    /// Record the effective level of a block; requires the write lock
    pub fn set_level(&self, task: TaskAttemptId, block: &BlockId, level: StorageLevel) -> Result<()> {
        let mut state = self.state.lock();
        match state.infos.get_mut(block) {
            Some(info) if info.writer_task == Some(task) => {
                info.level = level;
                Ok(())
            }
            Some(_) | None => Err(Error::Storage(StorageError::NotLockedForWriting(
                block.to_string(),
            ))),
        }
    }

    /// Unlocked snapshot of a block's info, for status synthesis
    #[must_use]
    pub fn get(&self, block: &BlockId) -> Option<BlockInfo> {
        self.state.lock().infos.get(block).cloned()
    }

    #[must_use]
    pub fn contains(&self, block: &BlockId) -> bool {
        self.state.lock().infos.contains_key(block)
    }

    /// Snapshot of every tracked block
    #[must_use]
    pub fn entries(&self) -> Vec<(BlockId, BlockInfo)> {
        self.state
            .lock()
            .infos
            .iter()
            .map(|(id, info)| (id.clone(), info.clone()))
            .collect()
    }

    /// Number of blocks tracked
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.state.lock().infos.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use tidal_common::types::NON_TASK_WRITER;

    fn block(n: u32) -> BlockId {
        BlockId::Rdd {
            rdd_id: 0,
            split_index: n,
        }
    }

    fn new_block_info() -> BlockInfo {
        BlockInfo::new(StorageLevel::MEMORY_ONLY, "test", true)
    }

    fn manager_with_block(n: u32) -> BlockInfoManager {
        let manager = BlockInfoManager::new();
        assert!(manager.lock_new_block_for_writing(NON_TASK_WRITER, &block(n), new_block_info()));
        manager.unlock(NON_TASK_WRITER, &block(n)).unwrap();
        manager
    }

    #[test]
    fn read_lock_on_missing_block_returns_none() {
        let manager = BlockInfoManager::new();
        assert!(manager.lock_for_reading(1, &block(0), true).is_none());
    }

    #[test]
    fn multiple_readers_may_hold_the_lock() {
        let manager = manager_with_block(0);
        assert!(manager.lock_for_reading(1, &block(0), true).is_some());
        assert!(manager.lock_for_reading(2, &block(0), true).is_some());

        let info = manager.get(&block(0)).unwrap();
        assert_eq!(info.reader_count(), 2);
        assert_eq!(info.writer_task(), None);
    }

    #[test]
    fn writer_excludes_readers_and_writers() {
        let manager = manager_with_block(0);
        assert!(manager.lock_for_writing(1, &block(0), true).is_some());

        assert!(manager.lock_for_reading(2, &block(0), false).is_none());
        assert!(manager.lock_for_writing(2, &block(0), false).is_none());

        let info = manager.get(&block(0)).unwrap();
        assert_eq!(info.reader_count(), 0);
        assert_eq!(info.writer_task(), Some(1));
    }

    #[test]
    fn readers_exclude_writers_until_last_unlock() {
        let manager = manager_with_block(0);
        assert!(manager.lock_for_reading(1, &block(0), true).is_some());
        assert!(manager.lock_for_reading(1, &block(0), true).is_some());

        assert!(manager.lock_for_writing(2, &block(0), false).is_none());
        manager.unlock(1, &block(0)).unwrap();
        assert!(manager.lock_for_writing(2, &block(0), false).is_none());
        manager.unlock(1, &block(0)).unwrap();
        assert!(manager.lock_for_writing(2, &block(0), false).is_some());
    }

    #[test]
    fn lock_new_block_inserts_or_reads_existing() {
        let manager = BlockInfoManager::new();
        assert!(manager.lock_new_block_for_writing(1, &block(0), new_block_info()));
        manager.unlock(1, &block(0)).unwrap();

        // Second attempt: block exists, caller gets a read lock instead
        assert!(!manager.lock_new_block_for_writing(2, &block(0), new_block_info()));
        let info = manager.get(&block(0)).unwrap();
        assert_eq!(info.reader_count(), 1);
    }

    #[test]
    fn downgrade_swaps_writer_for_one_reader() {
        let manager = manager_with_block(0);
        assert!(manager.lock_for_writing(1, &block(0), true).is_some());
        manager.downgrade_lock(1, &block(0)).unwrap();

        let info = manager.get(&block(0)).unwrap();
        assert_eq!(info.writer_task(), None);
        assert_eq!(info.reader_count(), 1);

        // Other readers may now join, writers may not
        assert!(manager.lock_for_reading(2, &block(0), false).is_some());
        assert!(manager.lock_for_writing(3, &block(0), false).is_none());
    }

    #[test]
    fn downgrade_without_write_lock_is_an_error() {
        let manager = manager_with_block(0);
        assert!(manager.downgrade_lock(1, &block(0)).is_err());
    }

    #[test]
    fn remove_requires_the_write_lock() {
        let manager = manager_with_block(0);
        assert!(manager.remove_block(1, &block(0)).is_err());

        manager.lock_for_writing(1, &block(0), true).unwrap();
        manager.remove_block(1, &block(0)).unwrap();
        assert!(!manager.contains(&block(0)));
    }

    #[test]
    fn release_all_locks_for_task_clears_its_locks() {
        let manager = manager_with_block(0);
        let _ = manager.lock_new_block_for_writing(7, &block(1), new_block_info());
        manager.lock_for_reading(7, &block(0), true).unwrap();
        manager.lock_for_reading(7, &block(0), true).unwrap();

        let mut released = manager.release_all_locks_for_task(7);
        released.sort();
        assert_eq!(released, vec![block(0), block(1)]);

        let info = manager.get(&block(0)).unwrap();
        assert_eq!(info.reader_count(), 0);
        let info = manager.get(&block(1)).unwrap();
        assert_eq!(info.writer_task(), None);

        // Nothing left recorded against the task
        assert!(manager.release_all_locks_for_task(7).is_empty());
    }

    #[test]
    fn write_lock_hand_off_across_tasks() {
        let manager = Arc::new(manager_with_block(0));
        manager.lock_for_reading(1, &block(0), true).unwrap();

        let contended = Arc::clone(&manager);
        let writer = std::thread::spawn(move || {
            // Blocks until task 1's read lock is released
            contended.lock_for_writing(2, &block(0), true).is_some()
        });

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(manager.get(&block(0)).unwrap().writer_task(), None);

        manager.release_all_locks_for_task(1);
        assert!(writer.join().unwrap());
        assert_eq!(manager.get(&block(0)).unwrap().writer_task(), Some(2));
    }

    #[test]
    fn waiters_observe_removal() {
        let manager = Arc::new(BlockInfoManager::new());
        assert!(manager.lock_new_block_for_writing(1, &block(0), new_block_info()));

        let waiting = Arc::clone(&manager);
        let reader = std::thread::spawn(move || waiting.lock_for_reading(2, &block(0), true));

        std::thread::sleep(Duration::from_millis(100));
        manager.remove_block(1, &block(0)).unwrap();

        // The waiter wakes and finds the block gone
        assert!(reader.join().unwrap().is_none());
    }

    #[test]
    fn set_size_requires_write_lock() {
        let manager = manager_with_block(0);
        assert!(manager.set_size(1, &block(0), 100).is_err());

        manager.lock_for_writing(1, &block(0), true).unwrap();
        manager.set_size(1, &block(0), 100).unwrap();
        assert_eq!(manager.get(&block(0)).unwrap().size, 100);
    }
}
