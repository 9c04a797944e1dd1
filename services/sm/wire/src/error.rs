//! Unit modelling error types.

use crate::unit::UnitKind;
use thiserror::Error;

/// Errors raised while encoding or rehydrating units
#[derive(Error, Debug)]
pub enum WireError {
    /// Kind name outside the known set
    #[error("unknown unit kind {0:?}")]
    UnknownKind(String),

    /// Known kind that can never sit in the unacked queue
    #[error("unit kind {0} is not trackable")]
    Untrackable(UnitKind),

    /// Payload could not be decoded into the unit for its kind
    #[error("malformed {kind} unit: {source}")]
    Malformed {
        /// Kind the payload was decoded as
        kind: UnitKind,
        /// Underlying decode error
        #[source]
        source: serde_json::Error,
    },
}
