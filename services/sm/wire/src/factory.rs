//! Rehydration of persisted queue entries.
//!
//! Persisted entries are `(kind name, JSON payload)` pairs. The kind name is
//! resolved against the closed [`UnitKind`] set and the payload is decoded as
//! the stanza for that kind. Anything else is an error: dropping an entry would
//! leave the restored counters describing a queue that no longer exists.

use serde_json::Value;
use tracing::trace;

use crate::error::WireError;
use crate::unit::{Stanza, Unit, UnitKind};

/// Builds units from persisted queue entries
pub trait UnitFactory: Send + Sync {
    /// Rebuild the unit stored under `kind` with payload `raw`
    fn rehydrate(&self, kind: &str, raw: &Value) -> Result<Unit, WireError>;
}

/// Default factory for message, presence and iq stanzas
#[derive(Debug, Clone, Copy, Default)]
pub struct StanzaFactory;

impl UnitFactory for StanzaFactory {
    fn rehydrate(&self, kind: &str, raw: &Value) -> Result<Unit, WireError> {
        let kind: UnitKind = kind.parse()?;
        trace!("Rehydrating queued {} unit", kind);

        let stanza = || {
            serde_json::from_value::<Stanza>(raw.clone())
                .map_err(|source| WireError::Malformed { kind, source })
        };

        match kind {
            UnitKind::Message => Ok(Unit::Message(stanza()?)),
            UnitKind::Presence => Ok(Unit::Presence(stanza()?)),
            UnitKind::Iq => Ok(Unit::Iq(stanza()?)),
            other => Err(WireError::Untrackable(other)),
        }
    }
}

/// Encode a trackable unit into its persisted `(kind, payload)` form
pub fn encode_unit(unit: &Unit) -> Result<(UnitKind, Value), WireError> {
    let kind = unit.kind();
    let stanza = unit.stanza().ok_or(WireError::Untrackable(kind))?;
    let raw = serde_json::to_value(stanza).map_err(|source| WireError::Malformed { kind, source })?;
    Ok((kind, raw))
}
