//! Unit and kind definitions.

use bitflags::bitflags;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::WireError;

/// Application stanza carried by message, presence and iq units.
///
/// The payload is the already-encoded body; stream management never looks
/// inside it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stanza {
    /// Stanza id attribute
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Recipient address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    /// Sender address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<String>,
    /// Opaque encoded body
    #[serde(default)]
    pub payload: Bytes,
}

impl Stanza {
    /// Create a stanza with an id and payload
    pub fn new(id: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            id: Some(id.into()),
            to: None,
            from: None,
            payload: payload.into(),
        }
    }

    /// Set the recipient
    pub fn to(mut self, to: impl Into<String>) -> Self {
        self.to = Some(to.into());
        self
    }
}

/// A logical protocol unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Unit {
    /// Message stanza
    Message(Stanza),
    /// Presence stanza
    Presence(Stanza),
    /// Request/response query stanza
    Iq(Stanza),
    /// Request to enable stream management
    Enable {
        /// Ask the peer for a resumable session
        resume: bool,
    },
    /// Peer accepted the enable request
    Enabled {
        /// Resumption token, absent when the peer refuses resumption
        id: Option<String>,
        /// Peer's echo of the resume capability
        #[serde(default)]
        resume: bool,
    },
    /// Request to resume a previous session
    Resume {
        /// Inbound units handled before the interruption
        h: u32,
        /// Token of the session being resumed
        previd: String,
    },
    /// Peer accepted the resume request
    Resumed {
        /// Token of the resumed session
        previd: String,
        /// Peer's handled count, if supplied
        #[serde(default)]
        h: Option<u32>,
    },
    /// Acknowledgment carrying a handled count
    Ack {
        /// Units handled by the sender of the ack
        h: u32,
    },
    /// Request for an acknowledgment
    Request,
    /// Peer rejected enable or resume
    Failed,
}

impl Unit {
    /// Kind of this unit
    pub fn kind(&self) -> UnitKind {
        match self {
            Unit::Message(_) => UnitKind::Message,
            Unit::Presence(_) => UnitKind::Presence,
            Unit::Iq(_) => UnitKind::Iq,
            Unit::Enable { .. } => UnitKind::Enable,
            Unit::Enabled { .. } => UnitKind::Enabled,
            Unit::Resume { .. } => UnitKind::Resume,
            Unit::Resumed { .. } => UnitKind::Resumed,
            Unit::Ack { .. } => UnitKind::Ack,
            Unit::Request => UnitKind::Request,
            Unit::Failed => UnitKind::Failed,
        }
    }

    /// Stanza carried by this unit, if it is a message, presence or iq
    pub fn stanza(&self) -> Option<&Stanza> {
        match self {
            Unit::Message(s) | Unit::Presence(s) | Unit::Iq(s) => Some(s),
            _ => None,
        }
    }
}

/// Closed set of unit kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitKind {
    /// Message stanza
    Message,
    /// Presence stanza
    Presence,
    /// Iq stanza
    Iq,
    /// Enable request
    Enable,
    /// Enable response
    Enabled,
    /// Resume request
    Resume,
    /// Resume response
    Resumed,
    /// Acknowledgment
    Ack,
    /// Acknowledgment request
    Request,
    /// Enable/resume failure
    Failed,
}

impl UnitKind {
    /// Name used in persisted snapshots
    pub fn as_str(self) -> &'static str {
        match self {
            UnitKind::Message => "message",
            UnitKind::Presence => "presence",
            UnitKind::Iq => "iq",
            UnitKind::Enable => "enable",
            UnitKind::Enabled => "enabled",
            UnitKind::Resume => "resume",
            UnitKind::Resumed => "resumed",
            UnitKind::Ack => "ack",
            UnitKind::Request => "request",
            UnitKind::Failed => "failed",
        }
    }

    /// Trackable flag for this kind; control kinds have none
    pub fn trackable_flag(self) -> Option<TrackableKinds> {
        match self {
            UnitKind::Message => Some(TrackableKinds::MESSAGE),
            UnitKind::Presence => Some(TrackableKinds::PRESENCE),
            UnitKind::Iq => Some(TrackableKinds::IQ),
            _ => None,
        }
    }
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitKind {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "message" => UnitKind::Message,
            "presence" => UnitKind::Presence,
            "iq" => UnitKind::Iq,
            "enable" => UnitKind::Enable,
            "enabled" => UnitKind::Enabled,
            "resume" => UnitKind::Resume,
            "resumed" => UnitKind::Resumed,
            "ack" => UnitKind::Ack,
            "request" => UnitKind::Request,
            "failed" => UnitKind::Failed,
            other => return Err(WireError::UnknownKind(other.to_string())),
        })
    }
}

bitflags! {
    /// Kinds the unacked queue accepts
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TrackableKinds: u8 {
        /// Message stanzas
        const MESSAGE = 0b0000_0001;
        /// Presence stanzas
        const PRESENCE = 0b0000_0010;
        /// Iq stanzas
        const IQ = 0b0000_0100;
    }
}

impl TrackableKinds {
    /// Whether `kind` is in this set
    pub fn accepts(self, kind: UnitKind) -> bool {
        kind.trackable_flag()
            .map(|flag| self.contains(flag))
            .unwrap_or(false)
    }
}

impl Default for TrackableKinds {
    fn default() -> Self {
        TrackableKinds::all()
    }
}
