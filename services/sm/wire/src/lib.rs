//! Logical protocol units and queue rehydration for stream management.
//!
//! Byte-level encoding of units is owned by the surrounding client. This crate
//! only models what the stream management layer needs to reason about:
//!
//! - **Units**: the stanza kinds that can be tracked (message, presence, iq)
//!   and the stream management control units (enable, resume, ack, ...)
//! - **Kinds**: an explicit, closed set of unit kind names used in snapshots
//! - **Rehydration**: a tagged-variant factory that turns persisted queue
//!   entries back into units, failing on anything it does not recognise
//!
//! ## Control units
//!
//! ```text
//! +-----------+-----------+------------------------------+
//! | unit      | direction | fields                       |
//! +-----------+-----------+------------------------------+
//! | enable    | out       | resume                       |
//! | enabled   | in        | id?, resume                  |
//! | resume    | out       | h, previd                    |
//! | resumed   | in        | previd, h?                   |
//! | ack       | either    | h                            |
//! | request   | either    | -                            |
//! | failed    | in        | -                            |
//! +-----------+-----------+------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod factory;
pub mod unit;

// Re-export main types
pub use error::WireError;
pub use factory::{encode_unit, StanzaFactory, UnitFactory};
pub use unit::{Stanza, TrackableKinds, Unit, UnitKind};
