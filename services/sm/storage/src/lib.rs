//! Snapshot persistence for stream management.
//!
//! The session saves a [`Snapshot`] after every change to its counters or its
//! unacked queue, restores one at construction, and clears it when the peer
//! reports failure. This crate defines that contract and ships two backends:
//! an in-memory slot for tests and simulations, and a checksummed file.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backend;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

/// Persisted unacked-queue entry
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedEntry {
    /// Unit kind name
    pub kind: String,
    /// Unit payload as produced by the unit encoder
    pub unit: Value,
}

/// Everything needed to resume a stream after a restart
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Identity of the account that owns the stream
    pub owner: String,
    /// Resumption token granted by the peer
    #[serde(default)]
    pub resumption_id: Option<String>,
    /// Last handled count acknowledged by the peer
    #[serde(default)]
    pub last_ack: Option<u32>,
    /// Inbound units handled locally
    #[serde(default)]
    pub handled: Option<u32>,
    /// Outbound units awaiting acknowledgment, oldest first
    #[serde(default)]
    pub queue: Vec<PersistedEntry>,
}

impl Snapshot {
    /// Resumption id, last ack and handled count, when all three are present
    pub fn resume_point(&self) -> Option<(&str, u32, u32)> {
        Some((self.resumption_id.as_deref()?, self.last_ack?, self.handled?))
    }

    /// Whether the snapshot carries enough state to resume from
    pub fn is_complete(&self) -> bool {
        self.resume_point().is_some()
    }
}

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),
    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Save/restore/clear contract consumed by the session
pub trait SnapshotStore: Send + Sync {
    /// Replace the stored snapshot
    fn save(&self, snapshot: &Snapshot) -> Result<(), StorageError>;

    /// Load the stored snapshot, if any
    fn restore(&self) -> Result<Option<Snapshot>, StorageError>;

    /// Forget the stored snapshot
    fn clear(&self) -> Result<(), StorageError>;
}

/// Storage backend configuration
#[derive(Clone, Debug, Default)]
pub enum StorageMode {
    /// In-memory storage (dev/tests only)
    #[default]
    InMemory,
    /// Single checksummed snapshot file
    File {
        /// Snapshot file path
        path: PathBuf,
        /// Fsync the file before it replaces the previous snapshot
        fsync: bool,
    },
}

// Re-export backend implementations
pub use backend::file::{FileStore, FileStoreConfig};
pub use backend::mem::MemoryStore;

/// Create a store from configuration
pub fn open(mode: StorageMode) -> Result<Box<dyn SnapshotStore>, StorageError> {
    match mode {
        StorageMode::InMemory => Ok(Box::new(MemoryStore::new())),
        StorageMode::File { path, fsync } => {
            Ok(Box::new(FileStore::new(FileStoreConfig { path, fsync })?))
        }
    }
}
