//! On-disk block tier
//!
//! Block files are sharded across the configured local directories, each
//! subdivided into hashed subdirectories so no single directory grows
//! unboundedly. Block id to path is deterministic: the same id always maps
//! to the same file.

use std::fs::{File, OpenOptions};
use std::hash::{Hash, Hasher};
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, error, info, warn};

use tidal_common::error::{Error, Result, StorageError};
use tidal_common::metrics::record_block_stored;
use tidal_common::types::BlockId;

/// Owns the directory tree block files live in
pub struct DiskBlockManager {
    local_dirs: Vec<PathBuf>,
    sub_dirs_per_local_dir: u32,
    /// External shuffle services keep serving files after the node stops,
    /// in which case shutdown must leave them in place
    delete_files_on_stop: bool,
}

fn hash_of(name: &str) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    hasher.finish()
}

impl DiskBlockManager {
    pub fn new(
        configured_dirs: &[String],
        sub_dirs_per_local_dir: u32,
        delete_files_on_stop: bool,
    ) -> Result<Self> {
        if configured_dirs.is_empty() {
            return Err(Error::Config("No local directories configured".into()));
        }

        let mut local_dirs = Vec::with_capacity(configured_dirs.len());
        for dir in configured_dirs {
            let root = PathBuf::from(dir).join(format!("blockmgr-{}", uuid::Uuid::new_v4()));
            std::fs::create_dir_all(&root)?;
            local_dirs.push(root);
        }
        info!(
            "Disk block manager initialized with {} local dirs",
            local_dirs.len()
        );

        Ok(Self {
            local_dirs,
            sub_dirs_per_local_dir,
            delete_files_on_stop,
        })
    }

    /// The local directories, for registration with an external shuffle
    /// service
    #[must_use]
    pub fn local_dirs(&self) -> Vec<String> {
        self.local_dirs
            .iter()
            .map(|p| p.to_string_lossy().to_string())
            .collect()
    }

    #[must_use]
    pub fn sub_dirs_per_local_dir(&self) -> u32 {
        self.sub_dirs_per_local_dir
    }

    /// The file a block maps to, creating its subdirectory on first use
    pub fn get_file(&self, block: &BlockId) -> Result<PathBuf> {
        let name = block.to_string();
        let hash = hash_of(&name);
        let dir_index = (hash % self.local_dirs.len() as u64) as usize;
        let sub_index = (hash / self.local_dirs.len() as u64) % u64::from(self.sub_dirs_per_local_dir);

        let sub_dir = self.local_dirs[dir_index].join(format!("{sub_index:02x}"));
        if !sub_dir.exists() {
            std::fs::create_dir_all(&sub_dir)?;
        }
        Ok(sub_dir.join(name))
    }

    /// Allocate a file for data that is not a block yet, e.g. an in-flight
    /// remote fetch
    pub fn create_temp_file(&self, prefix: &str) -> Result<PathBuf> {
        let dir = &self.local_dirs[0];
        Ok(dir.join(format!("{prefix}-{}", uuid::Uuid::new_v4())))
    }

    /// Every block currently on disk, parsed back from file names
    #[must_use]
    pub fn all_blocks(&self) -> Vec<BlockId> {
        let mut blocks = Vec::new();
        for dir in &self.local_dirs {
            let Ok(sub_dirs) = std::fs::read_dir(dir) else {
                continue;
            };
            for sub_dir in sub_dirs.flatten() {
                let Ok(files) = std::fs::read_dir(sub_dir.path()) else {
                    continue;
                };
                for file in files.flatten() {
                    if let Some(name) = file.file_name().to_str() {
                        if let Ok(block) = BlockId::from_str(name) {
                            blocks.push(block);
                        }
                    }
                }
            }
        }
        blocks
    }

    /// Delete the directory tree unless an external shuffle service owns it
    pub fn stop(&self) {
        if !self.delete_files_on_stop {
            debug!("Leaving block files in place for the external shuffle service");
            return;
        }
        for dir in &self.local_dirs {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                error!("Failed to remove local dir {:?}: {}", dir, e);
            }
        }
    }
}

/// Reads and writes whole blocks against the [`DiskBlockManager`] layout
pub struct DiskStore {
    disk_manager: Arc<DiskBlockManager>,
}

impl DiskStore {
    #[must_use]
    pub fn new(disk_manager: Arc<DiskBlockManager>) -> Self {
        Self { disk_manager }
    }

    /// Stream a block to disk through `write`. A failed write never leaves
    /// a partial file behind. Returns the byte size written.
    pub fn put<F>(&self, block: &BlockId, write: F) -> Result<u64>
    where
        F: FnOnce(&mut dyn Write) -> Result<()>,
    {
        if self.contains(block) {
            warn!("Block {} is already on disk, overwriting", block);
            self.remove(block);
        }

        let path = self.disk_manager.get_file(block)?;
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)?;
        let mut out = BufWriter::new(file);

        let outcome = write(&mut out).and_then(|()| out.flush().map_err(Error::Io));
        if let Err(e) = outcome {
            drop(out);
            let _ = std::fs::remove_file(&path);
            return Err(e);
        }
        drop(out);

        let size = std::fs::metadata(&path)?.len();
        record_block_stored("disk", size);
        debug!("Block {} written to disk ({} bytes)", block, size);
        Ok(size)
    }

    /// Write a block of ready bytes
    pub fn put_bytes(&self, block: &BlockId, bytes: &Bytes) -> Result<u64> {
        self.put(block, |out| {
            out.write_all(bytes).map_err(Error::Io)?;
            Ok(())
        })
    }

    /// Read a block's bytes fully
    pub fn get_bytes(&self, block: &BlockId) -> Result<Bytes> {
        let path = self.disk_manager.get_file(block)?;
        let mut file = File::open(&path).map_err(|_| {
            Error::Storage(StorageError::BlockNotFound(block.to_string()))
        })?;
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .map_err(|e| Error::Storage(StorageError::ReadFailed(block.to_string(), e.to_string())))?;
        Ok(Bytes::from(contents))
    }

    #[must_use]
    pub fn get_size(&self, block: &BlockId) -> u64 {
        self.disk_manager
            .get_file(block)
            .ok()
            .and_then(|path| std::fs::metadata(path).ok())
            .map_or(0, |meta| meta.len())
    }

    #[must_use]
    pub fn contains(&self, block: &BlockId) -> bool {
        self.disk_manager
            .get_file(block)
            .map(|path| path.exists())
            .unwrap_or(false)
    }

    /// Delete the block's file. Returns whether a file was deleted.
    pub fn remove(&self, block: &BlockId) -> bool {
        match self.disk_manager.get_file(block) {
            Ok(path) if path.exists() => match std::fs::remove_file(&path) {
                Ok(()) => true,
                Err(e) => {
                    warn!("Failed to delete block file {:?}: {}", path, e);
                    false
                }
            },
            _ => false,
        }
    }
}
