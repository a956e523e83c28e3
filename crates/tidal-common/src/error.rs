//! Error types for the Tidal block storage service
//!
//! Provides a unified error type hierarchy for the entire subsystem.

use thiserror::Error;

/// Result type alias using Tidal's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the block storage service
#[derive(Error, Debug)]
pub enum Error {
    // Storage Errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // Network Errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    // Cluster Errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal Errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Storage-related errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Block not found: {0}")]
    BlockNotFound(String),

    #[error("Block {0} was present but could not be read back: {1}")]
    CorruptData(String, String),

    #[error("Write failed for block {0}: {1}")]
    WriteFailed(String, String),

    #[error("Read failed for block {0}: {1}")]
    ReadFailed(String, String),

    #[error("Invalid storage level: {0}")]
    InvalidStorageLevel(String),

    #[error("Block {0} is not locked for writing by the caller")]
    NotLockedForWriting(String),

    #[error("Block id could not be parsed: {0}")]
    UnrecognizedBlockId(String),
}

/// Network-related errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Connection to {0} failed: {1}")]
    ConnectionFailed(String, String),

    #[error("Fetch of block {block} failed after {attempts} attempts")]
    FetchFailed { block: String, attempts: u32 },

    #[error("Upload of block {0} to {1} failed: {2}")]
    UploadFailed(String, String, String),

    #[error("Timeout: {0}")]
    Timeout(String),
}

/// Cluster-related errors
#[derive(Error, Debug)]
pub enum ClusterError {
    #[error("Master unavailable: {0}")]
    MasterUnavailable(String),

    #[error("Block manager {0} is not registered with the master")]
    UnknownBlockManager(String),

    #[error("No locations known for block {0}")]
    NoLocations(String),

    #[error("Shuffle service registration failed after {0} attempts")]
    ShuffleRegistrationFailed(u32),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
