//! Outbound seams of the session: unit transmission and application events.

use sm_wire::Unit;
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::SmError;

/// Observable stream management events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SmEvent {
    /// The peer confirmed receipt of a tracked unit
    Acknowledged(Unit),
}

/// Transmits units to the peer
pub trait Transport: Send + Sync {
    /// Send one unit
    fn send(&self, unit: Unit) -> Result<(), SmError>;
}

/// Receives events for application listeners
pub trait EventSink: Send + Sync {
    /// Fire one event
    fn notify(&self, event: SmEvent);
}

/// Receiving ends of a [`ChannelTransport`]
pub struct ChannelEndpoints {
    /// Units handed to the transport, in send order
    pub units: mpsc::UnboundedReceiver<Unit>,
    /// Events fired by the session
    pub events: mpsc::UnboundedReceiver<SmEvent>,
}

/// Transport and event sink backed by unbounded tokio channels.
///
/// Sending never blocks, so it can be driven from synchronous session code
/// while a writer task drains the other end.
#[derive(Clone)]
pub struct ChannelTransport {
    units: mpsc::UnboundedSender<Unit>,
    events: mpsc::UnboundedSender<SmEvent>,
}

impl ChannelTransport {
    /// Create a transport and the receivers for its output
    pub fn new() -> (Self, ChannelEndpoints) {
        let (units_tx, units_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                units: units_tx,
                events: events_tx,
            },
            ChannelEndpoints {
                units: units_rx,
                events: events_rx,
            },
        )
    }
}

impl Transport for ChannelTransport {
    fn send(&self, unit: Unit) -> Result<(), SmError> {
        self.units
            .send(unit)
            .map_err(|e| SmError::Transport(format!("unit channel closed, dropped {}", e.0.kind())))
    }
}

impl EventSink for ChannelTransport {
    fn notify(&self, event: SmEvent) {
        if self.events.send(event).is_err() {
            debug!("No event listener, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sm_wire::Stanza;

    #[test]
    fn test_channel_transport_delivers_in_order() {
        let (transport, mut endpoints) = ChannelTransport::new();

        transport.send(Unit::Request).unwrap();
        transport.send(Unit::Ack { h: 2 }).unwrap();
        assert_eq!(endpoints.units.try_recv().unwrap(), Unit::Request);
        assert_eq!(endpoints.units.try_recv().unwrap(), Unit::Ack { h: 2 });
        assert!(endpoints.units.try_recv().is_err());

        let unit = Unit::Message(Stanza::new("m1", "hi"));
        transport.notify(SmEvent::Acknowledged(unit.clone()));
        assert_eq!(
            endpoints.events.try_recv().unwrap(),
            SmEvent::Acknowledged(unit)
        );
    }

    #[test]
    fn test_channel_transport_closed() {
        let (transport, endpoints) = ChannelTransport::new();
        drop(endpoints);

        assert!(matches!(
            transport.send(Unit::Request),
            Err(SmError::Transport(_))
        ));
        // Events without a listener are dropped quietly
        transport.notify(SmEvent::Acknowledged(Unit::Request));
    }
}
