//! Core type definitions for the Tidal block storage service

use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, StorageError};

/// Task attempt identifier
pub type TaskAttemptId = i64;

/// Lock owner used for administrative operations that do not run inside a task
pub const NON_TASK_WRITER: TaskAttemptId = -1024;

/// Executor id used by the driver-side block manager
pub const DRIVER_IDENTIFIER: &str = "driver";

// ============================================================================
// Block Identifiers
// ============================================================================

/// Identifies a particular block of data, usually associated with a single
/// file. The canonical textual form (via `Display`/`FromStr`) is globally
/// unique and is what travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BlockId {
    /// A cached partition of a dataset
    Rdd { rdd_id: u32, split_index: u32 },
    /// Output of one map task for one reduce partition
    Shuffle {
        shuffle_id: u32,
        map_id: u32,
        reduce_id: u32,
    },
    /// A piece of a broadcast variable
    Broadcast {
        broadcast_id: u64,
        field: Option<String>,
    },
    /// An indirect task result, fetched by the driver
    TaskResult { task_id: u64 },
    /// Short-lived local scratch block
    TempLocal { id: uuid::Uuid },
    /// A block received from an input stream
    Stream { stream_id: u32, unique_id: u64 },
}

impl BlockId {
    /// Whether this block belongs to the shuffle subsystem. Shuffle blocks
    /// are served by the shuffle resolver and bypass the lock manager.
    #[must_use]
    pub fn is_shuffle(&self) -> bool {
        matches!(self, BlockId::Shuffle { .. })
    }

    /// Whether this block is a cached dataset partition
    #[must_use]
    pub fn is_rdd(&self) -> bool {
        matches!(self, BlockId::Rdd { .. })
    }

    /// Whether this block is part of a broadcast variable
    #[must_use]
    pub fn is_broadcast(&self) -> bool {
        matches!(self, BlockId::Broadcast { .. })
    }

    /// The dataset id, for RDD blocks
    #[must_use]
    pub fn rdd_id(&self) -> Option<u32> {
        match self {
            BlockId::Rdd { rdd_id, .. } => Some(*rdd_id),
            _ => None,
        }
    }

    /// Allocate a fresh scratch block id
    #[must_use]
    pub fn new_temp_local() -> Self {
        BlockId::TempLocal {
            id: uuid::Uuid::new_v4(),
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockId::Rdd { rdd_id, split_index } => write!(f, "rdd_{rdd_id}_{split_index}"),
            BlockId::Shuffle {
                shuffle_id,
                map_id,
                reduce_id,
            } => write!(f, "shuffle_{shuffle_id}_{map_id}_{reduce_id}"),
            BlockId::Broadcast {
                broadcast_id,
                field: None,
            } => write!(f, "broadcast_{broadcast_id}"),
            BlockId::Broadcast {
                broadcast_id,
                field: Some(field),
            } => write!(f, "broadcast_{broadcast_id}_{field}"),
            BlockId::TaskResult { task_id } => write!(f, "taskresult_{task_id}"),
            BlockId::TempLocal { id } => write!(f, "temp_local_{id}"),
            BlockId::Stream {
                stream_id,
                unique_id,
            } => write!(f, "input-{stream_id}-{unique_id}"),
        }
    }
}

impl FromStr for BlockId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn unrecognized(s: &str) -> Error {
            Error::Storage(StorageError::UnrecognizedBlockId(s.to_string()))
        }

        if let Some(rest) = s.strip_prefix("rdd_") {
            let (rdd, split) = rest.split_once('_').ok_or_else(|| unrecognized(s))?;
            return Ok(BlockId::Rdd {
                rdd_id: rdd.parse().map_err(|_| unrecognized(s))?,
                split_index: split.parse().map_err(|_| unrecognized(s))?,
            });
        }
        if let Some(rest) = s.strip_prefix("shuffle_") {
            let mut parts = rest.splitn(3, '_');
            let shuffle = parts.next().ok_or_else(|| unrecognized(s))?;
            let map = parts.next().ok_or_else(|| unrecognized(s))?;
            let reduce = parts.next().ok_or_else(|| unrecognized(s))?;
            return Ok(BlockId::Shuffle {
                shuffle_id: shuffle.parse().map_err(|_| unrecognized(s))?,
                map_id: map.parse().map_err(|_| unrecognized(s))?,
                reduce_id: reduce.parse().map_err(|_| unrecognized(s))?,
            });
        }
        if let Some(rest) = s.strip_prefix("broadcast_") {
            return match rest.split_once('_') {
                Some((id, field)) => Ok(BlockId::Broadcast {
                    broadcast_id: id.parse().map_err(|_| unrecognized(s))?,
                    field: Some(field.to_string()),
                }),
                None => Ok(BlockId::Broadcast {
                    broadcast_id: rest.parse().map_err(|_| unrecognized(s))?,
                    field: None,
                }),
            };
        }
        if let Some(rest) = s.strip_prefix("taskresult_") {
            return Ok(BlockId::TaskResult {
                task_id: rest.parse().map_err(|_| unrecognized(s))?,
            });
        }
        if let Some(rest) = s.strip_prefix("temp_local_") {
            return Ok(BlockId::TempLocal {
                id: rest.parse().map_err(|_| unrecognized(s))?,
            });
        }
        if let Some(rest) = s.strip_prefix("input-") {
            let (stream, unique) = rest.split_once('-').ok_or_else(|| unrecognized(s))?;
            return Ok(BlockId::Stream {
                stream_id: stream.parse().map_err(|_| unrecognized(s))?,
                unique_id: unique.parse().map_err(|_| unrecognized(s))?,
            });
        }
        Err(unrecognized(s))
    }
}

// ============================================================================
// Storage Levels
// ============================================================================

/// Which memory pool a block's bytes are accounted against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MemoryMode {
    OnHeap,
    OffHeap,
}

/// Where and how a block should be stored: on disk, in memory, in the
/// off-heap pool, kept as deserialized values, and with how many replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StorageLevel {
    pub use_disk: bool,
    pub use_memory: bool,
    pub use_off_heap: bool,
    pub deserialized: bool,
    pub replication: u8,
}

impl StorageLevel {
    pub const NONE: Self = Self::new(false, false, false, false, 1);
    pub const DISK_ONLY: Self = Self::new(true, false, false, false, 1);
    pub const DISK_ONLY_2: Self = Self::new(true, false, false, false, 2);
    pub const MEMORY_ONLY: Self = Self::new(false, true, false, true, 1);
    pub const MEMORY_ONLY_2: Self = Self::new(false, true, false, true, 2);
    pub const MEMORY_ONLY_SER: Self = Self::new(false, true, false, false, 1);
    pub const MEMORY_ONLY_SER_2: Self = Self::new(false, true, false, false, 2);
    pub const MEMORY_AND_DISK: Self = Self::new(true, true, false, true, 1);
    pub const MEMORY_AND_DISK_2: Self = Self::new(true, true, false, true, 2);
    pub const MEMORY_AND_DISK_SER: Self = Self::new(true, true, false, false, 1);
    pub const MEMORY_AND_DISK_SER_2: Self = Self::new(true, true, false, false, 2);
    pub const OFF_HEAP: Self = Self::new(true, true, true, false, 1);

    #[must_use]
    pub const fn new(
        use_disk: bool,
        use_memory: bool,
        use_off_heap: bool,
        deserialized: bool,
        replication: u8,
    ) -> Self {
        Self {
            use_disk,
            use_memory,
            use_off_heap,
            deserialized,
            replication,
        }
    }

    /// A level is valid when it places the block somewhere and asks for at
    /// least one copy. Off-heap storage additionally requires serialized
    /// bytes held in memory.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        if self.use_off_heap && (self.deserialized || !self.use_memory) {
            return false;
        }
        (self.use_memory || self.use_disk) && self.replication >= 1
    }

    /// The memory pool this level's in-memory bytes are accounted against
    #[must_use]
    pub fn memory_mode(&self) -> MemoryMode {
        if self.use_off_heap {
            MemoryMode::OffHeap
        } else {
            MemoryMode::OnHeap
        }
    }

    /// The same placement with a different replica count
    #[must_use]
    pub fn with_replication(mut self, replication: u8) -> Self {
        self.replication = replication;
        self
    }

    /// Encode as tag bytes: one flag byte and one replication byte.
    /// Used when a level travels with a replicated block.
    #[must_use]
    pub fn encode(&self) -> [u8; 2] {
        let mut flags = 0u8;
        if self.use_disk {
            flags |= 1 << 0;
        }
        if self.use_memory {
            flags |= 1 << 1;
        }
        if self.use_off_heap {
            flags |= 1 << 2;
        }
        if self.deserialized {
            flags |= 1 << 3;
        }
        [flags, self.replication]
    }

    /// Decode the tag-byte form produced by [`StorageLevel::encode`]
    #[must_use]
    pub fn decode(bytes: [u8; 2]) -> Self {
        Self {
            use_disk: bytes[0] & (1 << 0) != 0,
            use_memory: bytes[0] & (1 << 1) != 0,
            use_off_heap: bytes[0] & (1 << 2) != 0,
            deserialized: bytes[0] & (1 << 3) != 0,
            replication: bytes[1],
        }
    }
}

impl fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "StorageLevel(disk={}, memory={}, offheap={}, deserialized={}, replication={})",
            self.use_disk, self.use_memory, self.use_off_heap, self.deserialized, self.replication
        )
    }
}

// ============================================================================
// Node Identity
// ============================================================================

/// Identity of one block manager in the cluster. Equality and hashing ignore
/// the topology tag: two ids naming the same executor/host/port are the same
/// node regardless of what the topology mapper learned about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockManagerId {
    pub executor_id: String,
    pub host: String,
    pub port: u16,
    pub topology_info: Option<String>,
}

impl BlockManagerId {
    #[must_use]
    pub fn new(
        executor_id: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        topology_info: Option<String>,
    ) -> Self {
        Self {
            executor_id: executor_id.into(),
            host: host.into(),
            port,
            topology_info,
        }
    }

    /// Whether this id belongs to the driver's block manager
    #[must_use]
    pub fn is_driver(&self) -> bool {
        self.executor_id == DRIVER_IDENTIFIER
    }
}

impl PartialEq for BlockManagerId {
    fn eq(&self, other: &Self) -> bool {
        self.executor_id == other.executor_id && self.host == other.host && self.port == other.port
    }
}

impl Eq for BlockManagerId {}

impl Hash for BlockManagerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.executor_id.hash(state);
        self.host.hash(state);
        self.port.hash(state);
    }
}

impl fmt::Display for BlockManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "BlockManagerId({}, {}:{})",
            self.executor_id, self.host, self.port
        )
    }
}

// ============================================================================
// Block Status
// ============================================================================

/// A point-in-time snapshot of where a block lives and how large it is in
/// each tier. Always synthesized from the live stores, never cached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockStatus {
    pub storage_level: StorageLevel,
    pub mem_size: u64,
    pub disk_size: u64,
}

impl BlockStatus {
    /// Status of a block that is present nowhere
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            storage_level: StorageLevel::NONE,
            mem_size: 0,
            disk_size: 0,
        }
    }

    /// Whether any tier currently holds the block
    #[must_use]
    pub fn is_cached(&self) -> bool {
        self.mem_size + self.disk_size > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_display_round_trip() {
        let ids = vec![
            BlockId::Rdd {
                rdd_id: 3,
                split_index: 17,
            },
            BlockId::Shuffle {
                shuffle_id: 1,
                map_id: 2,
                reduce_id: 3,
            },
            BlockId::Broadcast {
                broadcast_id: 42,
                field: None,
            },
            BlockId::Broadcast {
                broadcast_id: 42,
                field: Some("piece0".to_string()),
            },
            BlockId::TaskResult { task_id: 9 },
            BlockId::new_temp_local(),
            BlockId::Stream {
                stream_id: 5,
                unique_id: 100,
            },
        ];

        for id in ids {
            let text = id.to_string();
            let parsed: BlockId = text.parse().expect("canonical form must parse");
            assert_eq!(parsed, id, "round trip failed for {text}");
        }
    }

    #[test]
    fn block_id_rejects_garbage() {
        assert!("".parse::<BlockId>().is_err());
        assert!("rdd_1".parse::<BlockId>().is_err());
        assert!("shuffle_1_2".parse::<BlockId>().is_err());
        assert!("block_7".parse::<BlockId>().is_err());
    }

    #[test]
    fn broadcast_field_may_contain_underscores() {
        let id: BlockId = "broadcast_7_piece_0".parse().unwrap();
        assert_eq!(
            id,
            BlockId::Broadcast {
                broadcast_id: 7,
                field: Some("piece_0".to_string()),
            }
        );
    }

    #[test]
    fn shuffle_predicate() {
        let shuffle = BlockId::Shuffle {
            shuffle_id: 0,
            map_id: 0,
            reduce_id: 0,
        };
        assert!(shuffle.is_shuffle());
        assert!(!shuffle.is_rdd());

        let rdd = BlockId::Rdd {
            rdd_id: 0,
            split_index: 0,
        };
        assert!(!rdd.is_shuffle());
        assert_eq!(rdd.rdd_id(), Some(0));
    }

    #[test]
    fn storage_level_validity() {
        assert!(StorageLevel::MEMORY_ONLY.is_valid());
        assert!(StorageLevel::DISK_ONLY.is_valid());
        assert!(StorageLevel::OFF_HEAP.is_valid());
        assert!(!StorageLevel::NONE.is_valid());

        // Off-heap requires serialized bytes in memory
        let bad = StorageLevel::new(false, true, true, true, 1);
        assert!(!bad.is_valid());
        let bad = StorageLevel::new(true, false, true, false, 1);
        assert!(!bad.is_valid());

        let no_copies = StorageLevel::MEMORY_ONLY.with_replication(0);
        assert!(!no_copies.is_valid());
    }

    #[test]
    fn storage_level_tag_bytes_round_trip() {
        for level in [
            StorageLevel::MEMORY_ONLY,
            StorageLevel::MEMORY_AND_DISK_SER_2,
            StorageLevel::DISK_ONLY_2,
            StorageLevel::OFF_HEAP,
        ] {
            assert_eq!(StorageLevel::decode(level.encode()), level);
        }
    }

    #[test]
    fn block_manager_id_equality_ignores_topology() {
        let a = BlockManagerId::new("exec-1", "host-a", 7070, None);
        let b = BlockManagerId::new("exec-1", "host-a", 7070, Some("/rack1".to_string()));
        assert_eq!(a, b);

        let mut set = std::collections::HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn empty_status_is_not_cached() {
        assert!(!BlockStatus::empty().is_cached());
        assert!(!BlockStatus::empty().storage_level.is_valid());
    }
}
