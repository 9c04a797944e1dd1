//! ACK/REQUEST flow control, ENABLE/RESUME handshakes and resend for stream management.
//!
//! This crate provides the stream management state machine for a streaming
//! protocol client: it tracks outbound stanzas until the peer acknowledges
//! them, counts handled inbound stanzas, asks for acks when the unacked window
//! fills, and replays unacknowledged stanzas after a resume.
//!
//! ## Features
//!
//! - **Wraparound counters**: handled counts live modulo 2^32
//! - **Unacked queue**: FIFO of tracked message/presence/iq units
//! - **Handshakes**: enable and resume, with explicit teardown and failure reset
//! - **Persistence**: snapshot after every change, restore at construction
//!
//! ## Example
//!
//! ```rust,no_run
//! use sm_session::{ChannelTransport, Collaborators, SmConfig, SmEvent, StreamManagement};
//! use sm_storage::MemoryStore;
//! use sm_wire::{Stanza, Unit};
//!
//! # fn example() -> Result<(), sm_session::SmError> {
//! let (transport, mut endpoints) = ChannelTransport::new();
//! let io = Collaborators::new(transport.clone(), transport).with_store(MemoryStore::new());
//! let mut sm = StreamManagement::new(SmConfig::default(), io)?;
//!
//! if sm.is_resumable() {
//!     sm.resume()?;
//! } else {
//!     sm.enable()?;
//! }
//!
//! // Peer answers
//! sm.on_unit(&Unit::Enabled { id: Some("sid".to_string()), resume: true })?;
//!
//! // Outbound stanzas go through the session
//! sm.send(Unit::Message(Stanza::new("m1", "hello")))?;
//!
//! // Peer acknowledges
//! sm.on_unit(&Unit::Ack { h: 1 })?;
//! while let Ok(SmEvent::Acknowledged(unit)) = endpoints.events.try_recv() {
//!     println!("acked {:?}", unit);
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod queue;
pub mod sequence;
pub mod session;
pub mod transport;

// Re-export main types
pub use error::SmError;
pub use queue::{QueuedUnit, UnackedQueue};
pub use sequence::{distance, increment};
pub use session::{Collaborators, SmConfig, SmState, StreamManagement};
pub use transport::{ChannelEndpoints, ChannelTransport, EventSink, SmEvent, Transport};
