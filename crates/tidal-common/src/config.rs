//! Configuration management for the Tidal block storage service

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Main configuration structure for a block storage node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Node identity configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Storage tier configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Replication configuration
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Remote fetch configuration
    #[serde(default)]
    pub fetch: FetchConfig,

    /// Shuffle service configuration
    #[serde(default)]
    pub shuffle: ShuffleConfig,

    /// Event queue configuration
    #[serde(default)]
    pub events: EventsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            node: NodeConfig::default(),
            storage: StorageConfig::default(),
            replication: ReplicationConfig::default(),
            fetch: FetchConfig::default(),
            shuffle: ShuffleConfig::default(),
            events: EventsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML or JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        let config: Config = if path.as_ref().extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {e}")))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {e}")))?
        };

        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Executor id this node runs under
    pub executor_id: String,
    /// Hostname advertised to peers
    pub host: String,
    /// Port of the block transfer service
    pub port: u16,
    /// Optional topology tag (rack/zone), resolved by the topology mapper
    pub topology: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            executor_id: "0".to_string(),
            host: "localhost".to_string(),
            port: 7078,
            topology: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Local directories the disk tier shards block files across
    pub local_dirs: Vec<String>,
    /// Hashed subdirectories created under each local directory
    pub sub_dirs_per_local_dir: u32,
    /// On-heap storage memory budget in bytes
    pub on_heap_memory_bytes: u64,
    /// Off-heap storage memory budget in bytes
    pub off_heap_memory_bytes: u64,
    /// Initial memory reservation for unrolling an iterator, in bytes
    pub unroll_initial_reservation_bytes: u64,
    /// Record per-task updated block statuses for task metrics
    pub track_updated_block_statuses: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_dirs: vec!["/tmp/tidal".to_string()],
            sub_dirs_per_local_dir: 64,
            on_heap_memory_bytes: 512 * 1024 * 1024,
            off_heap_memory_bytes: 0,
            unroll_initial_reservation_bytes: 1024 * 1024,
            track_updated_block_statuses: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Peer prioritization policy: "random" or "topology"
    pub policy: String,
    /// Replication attempts tolerated beyond the first failure
    pub max_failures: u32,
    /// How long a fetched peer list stays fresh, in milliseconds
    pub cached_peers_ttl_ms: u64,
    /// Worker threads for replication and remote fetch (0 = auto, capped at 128)
    pub worker_threads: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            policy: "random".to_string(),
            max_failures: 1,
            cached_peers_ttl_ms: 60_000,
            worker_threads: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Failures against a single location before the location list is
    /// re-fetched from the master
    pub failures_before_location_refresh: u32,
    /// Fetched blocks larger than this spill to a temp file instead of memory
    pub max_remote_block_size_fetch_to_mem: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            failures_before_location_refresh: 5,
            max_remote_block_size_fetch_to_mem: 200 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleConfig {
    /// Serve shuffle files through an external shuffle service
    pub service_enabled: bool,
    /// Port of the external shuffle service
    pub service_port: u16,
    /// Synchronously flush shuffle writes
    pub sync_writes: bool,
    /// Timeout for one registration attempt, in milliseconds
    pub registration_timeout_ms: u64,
    /// Registration attempts before giving up
    pub registration_max_attempts: u32,
    /// Backoff between registration attempts, in milliseconds
    pub registration_retry_wait_ms: u64,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            service_enabled: false,
            service_port: 7337,
            sync_writes: false,
            registration_timeout_ms: 5_000,
            registration_max_attempts: 3,
            registration_retry_wait_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventsConfig {
    /// Capacity of the scheduler event queue
    pub queue_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 10_000,
        }
    }
}
