//! Stream management error types.

use sm_storage::StorageError;
use sm_wire::WireError;
use thiserror::Error;

/// Stream management errors
#[derive(Error, Debug)]
pub enum SmError {
    /// The transport refused a unit
    #[error("transport error: {0}")]
    Transport(String),

    /// Snapshot backend failure
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A persisted queue entry could not be rebuilt
    #[error("restore corrupted at queue entry {index}: {source}")]
    RestoreCorrupted {
        /// Position of the bad entry in the persisted queue
        index: usize,
        /// Why it could not be rebuilt
        #[source]
        source: WireError,
    },

    /// Resume requested without a resumption id
    #[error("no resumption id to resume with")]
    NotResumable,

    /// Unit encoding failure
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// Rejected configuration
    #[error("invalid configuration: {0}")]
    Config(String),
}
