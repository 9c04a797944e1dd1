//! Stream management state machine.
//!
//! One [`StreamManagement`] lives for the whole life of a client. It is driven
//! serially by the caller: handshake responses, acks and inbound stanzas come
//! in through the `on_*`/`process_ack`/`handle_inbound` methods, and outbound
//! stanzas pass through [`StreamManagement::track_outbound`] (or
//! [`StreamManagement::send`]) before they reach the wire.

use sm_storage::{Snapshot, SnapshotStore};
use sm_wire::{StanzaFactory, TrackableKinds, Unit, UnitFactory};
use tracing::{debug, info, warn};

use crate::error::SmError;
use crate::queue::{QueuedUnit, UnackedQueue};
use crate::sequence::{distance, increment};
use crate::transport::{EventSink, SmEvent, Transport};

/// Configuration for stream management
#[derive(Clone, Debug)]
pub struct SmConfig {
    /// Identity of the account owning the stream, stored in snapshots
    pub owner: String,
    /// Queue length at which an ack request is sent
    pub window_size: u32,
    /// Ask the peer for a resumable session on enable
    pub allow_resume: bool,
    /// Kinds of outbound units to track
    pub trackable: TrackableKinds,
}

impl Default for SmConfig {
    fn default() -> Self {
        Self {
            owner: String::new(),
            window_size: 1,
            allow_resume: true,
            trackable: TrackableKinds::default(),
        }
    }
}

/// Handshake state, derived from the inbound and outbound flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmState {
    /// Neither direction active
    Disabled,
    /// Request sent or response received, but not both
    HalfOpen,
    /// Both directions active
    Started,
}

/// Collaborators injected into the session
pub struct Collaborators {
    /// Where units are sent
    pub transport: Box<dyn Transport>,
    /// Where acknowledgment events go
    pub events: Box<dyn EventSink>,
    /// Rebuilds queued units from a snapshot
    pub factory: Box<dyn UnitFactory>,
    /// Snapshot backend, if the stream should survive restarts
    pub store: Option<Box<dyn SnapshotStore>>,
}

impl Collaborators {
    /// Collaborators with the default stanza factory and no persistence
    pub fn new(transport: impl Transport + 'static, events: impl EventSink + 'static) -> Self {
        Self {
            transport: Box::new(transport),
            events: Box::new(events),
            factory: Box::new(StanzaFactory),
            store: None,
        }
    }

    /// Persist through `store`
    pub fn with_store(mut self, store: impl SnapshotStore + 'static) -> Self {
        self.store = Some(Box::new(store));
        self
    }

    /// Rebuild queued units with `factory`
    pub fn with_factory(mut self, factory: impl UnitFactory + 'static) -> Self {
        self.factory = Box::new(factory);
        self
    }
}

/// Stream management session
pub struct StreamManagement {
    config: SmConfig,
    io: Collaborators,
    resumption_id: Option<String>,
    inbound_active: bool,
    outbound_active: bool,
    last_ack: u32,
    handled: u32,
    unacked: UnackedQueue,
    pending_ack_request: bool,
}

impl StreamManagement {
    /// Create a session and restore the stored snapshot, if any.
    ///
    /// An incomplete snapshot, or one belonging to another owner, is ignored
    /// and the session starts disabled; check [`is_resumable`](Self::is_resumable)
    /// to decide between `resume()` and `enable()`. A snapshot whose queue
    /// cannot be rebuilt fails with [`SmError::RestoreCorrupted`].
    pub fn new(config: SmConfig, io: Collaborators) -> Result<Self, SmError> {
        if config.window_size == 0 {
            return Err(SmError::Config("window_size must be at least 1".to_string()));
        }

        let mut sm = Self {
            unacked: UnackedQueue::new(config.trackable),
            config,
            io,
            resumption_id: None,
            inbound_active: false,
            outbound_active: false,
            last_ack: 0,
            handled: 0,
            pending_ack_request: false,
        };

        let restored = match &sm.io.store {
            Some(store) => store.restore()?,
            None => None,
        };
        if let Some(snapshot) = restored {
            sm.apply_snapshot(snapshot)?;
        }

        Ok(sm)
    }

    fn apply_snapshot(&mut self, snapshot: Snapshot) -> Result<(), SmError> {
        let Some((id, last_ack, handled)) = snapshot.resume_point() else {
            debug!("Ignoring incomplete stream snapshot for {}", snapshot.owner);
            return Ok(());
        };

        if snapshot.owner != self.config.owner {
            warn!(
                "Ignoring stream snapshot owned by {:?}, expected {:?}",
                snapshot.owner, self.config.owner
            );
            return Ok(());
        }

        let unacked = UnackedQueue::from_persisted(
            &snapshot.queue,
            self.io.factory.as_ref(),
            self.config.trackable,
        )?;

        info!(
            "Restored stream {}: last_ack={} handled={} unacked={}",
            id,
            last_ack,
            handled,
            unacked.len()
        );
        self.resumption_id = Some(id.to_string());
        self.last_ack = last_ack;
        self.handled = handled;
        self.unacked = unacked;
        Ok(())
    }

    /// Current state as a snapshot
    pub fn snapshot(&self) -> Result<Snapshot, SmError> {
        Ok(Snapshot {
            owner: self.config.owner.clone(),
            resumption_id: self.resumption_id.clone(),
            last_ack: Some(self.last_ack),
            handled: Some(self.handled),
            queue: self.unacked.to_persisted()?,
        })
    }

    fn persist(&self) {
        let Some(store) = &self.io.store else {
            return;
        };
        let result = self
            .snapshot()
            .and_then(|snapshot| store.save(&snapshot).map_err(SmError::from));
        if let Err(e) = result {
            warn!("Failed to persist stream state: {}", e);
        }
    }

    /// Ask the peer to enable stream management
    pub fn enable(&mut self) -> Result<(), SmError> {
        self.io.transport.send(Unit::Enable {
            resume: self.config.allow_resume,
        })?;
        self.handled = 0;
        self.outbound_active = true;
        info!("Sent enable (resume={})", self.config.allow_resume);
        Ok(())
    }

    /// Ask the peer to resume the stored session
    pub fn resume(&mut self) -> Result<(), SmError> {
        let previd = self.resumption_id.clone().ok_or(SmError::NotResumable)?;
        info!("Sent resume previd={} h={}", previd, self.handled);
        self.io.transport.send(Unit::Resume {
            h: self.handled,
            previd,
        })?;
        self.outbound_active = true;
        Ok(())
    }

    /// The peer enabled stream management
    pub fn on_enabled(&mut self, id: Option<String>) {
        info!("Stream management enabled (resumable={})", id.is_some());
        self.resumption_id = id;
        self.handled = 0;
        self.inbound_active = true;
        self.persist();
    }

    /// The peer resumed the session, optionally reporting its handled count
    pub fn on_resumed(&mut self, previd: String, h: Option<u32>) -> Result<(), SmError> {
        info!("Stream resumed previd={} h={:?}", previd, h);
        self.resumption_id = Some(previd);
        let replayed = match h {
            Some(h) => self.process_ack(h, true),
            None => Ok(()),
        };
        self.inbound_active = true;
        replayed
    }

    /// The peer failed enable or resume; forget everything.
    ///
    /// Safe to call in any state and more than once.
    pub fn on_failed(&mut self) {
        warn!(
            "Stream management failed, dropping {} unacked units",
            self.unacked.len()
        );
        self.inbound_active = false;
        self.outbound_active = false;
        self.resumption_id = None;
        self.last_ack = 0;
        self.handled = 0;
        self.unacked.clear();
        self.pending_ack_request = false;

        if let Some(store) = &self.io.store {
            if let Err(e) = store.clear() {
                warn!("Failed to clear stream state: {}", e);
            }
        }
    }

    /// Stop both directions but keep what is needed to resume later
    pub fn teardown(&mut self) {
        debug!(
            "Stream torn down, keeping resumable={} unacked={}",
            self.resumption_id.is_some(),
            self.unacked.len()
        );
        self.inbound_active = false;
        self.outbound_active = false;
        // Any outstanding request went down with the link
        self.pending_ack_request = false;
    }

    /// Request an ack, unless one is already outstanding
    pub fn send_ack_request(&mut self) -> Result<(), SmError> {
        if self.pending_ack_request {
            return Ok(());
        }
        self.io.transport.send(Unit::Request)?;
        self.pending_ack_request = true;
        debug!("Sent ack request, unacked={}", self.unacked.len());
        Ok(())
    }

    /// Acknowledge everything handled so far
    pub fn send_ack(&mut self) -> Result<(), SmError> {
        debug!("Sent ack h={}", self.handled);
        self.io.transport.send(Unit::Ack { h: self.handled })
    }

    /// Apply an ack count from the peer.
    ///
    /// With `resend`, everything still unacked afterwards is retransmitted in
    /// order and stays queued.
    pub fn process_ack(&mut self, h: u32, resend: bool) -> Result<(), SmError> {
        let num_acked = distance(h, self.last_ack);
        self.pending_ack_request = false;

        let mut popped = 0u32;
        while popped < num_acked {
            let Some(entry) = self.unacked.pop_front() else {
                break;
            };
            self.io.events.notify(SmEvent::Acknowledged(entry.unit));
            popped += 1;
        }
        if popped < num_acked {
            // Tolerated, but the peer counted more than we ever sent.
            warn!(
                "Ack desync: h={} last_ack={} covers {} units, only {} were unacked",
                h, self.last_ack, num_acked, popped
            );
        }
        debug!(
            "Processed ack h={} acked={} unacked={}",
            h,
            popped,
            self.unacked.len()
        );

        self.last_ack = h;
        self.persist();

        let replayed = if resend { self.replay_unacked() } else { Ok(()) };

        if self.need_ack_request() {
            self.send_ack_request()?;
        }
        replayed
    }

    fn replay_unacked(&mut self) -> Result<(), SmError> {
        let replay: Vec<QueuedUnit> = self.unacked.drain_all();
        if replay.is_empty() {
            return Ok(());
        }
        info!("Retransmitting {} unacked units", replay.len());

        let mut first_error = None;
        for entry in replay {
            let unit = entry.unit.clone();
            self.unacked.requeue(entry);
            if let Err(e) = self.io.transport.send(unit) {
                first_error.get_or_insert(e);
            }
        }
        self.persist();

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn track(&mut self, unit: &Unit) -> bool {
        if !self.outbound_active || !self.unacked.accepts(unit.kind()) {
            return false;
        }
        self.unacked.append(unit.clone());
        self.persist();
        true
    }

    /// Record an outbound unit for acknowledgment.
    ///
    /// Returns whether the unit was tracked; control units and anything sent
    /// while outbound tracking is off are ignored.
    pub fn track_outbound(&mut self, unit: &Unit) -> Result<bool, SmError> {
        if !self.track(unit) {
            return Ok(false);
        }
        if self.need_ack_request() {
            self.send_ack_request()?;
        }
        Ok(true)
    }

    /// Track and transmit an outbound unit
    pub fn send(&mut self, unit: Unit) -> Result<(), SmError> {
        let tracked = self.track(&unit);
        self.io.transport.send(unit)?;
        if tracked && self.need_ack_request() {
            self.send_ack_request()?;
        }
        Ok(())
    }

    /// Count one handled inbound unit
    pub fn handle_inbound(&mut self) {
        if self.inbound_active {
            self.handled = increment(self.handled);
            self.persist();
        }
    }

    /// Whether the queue has reached the window with no request outstanding
    pub fn need_ack_request(&self) -> bool {
        !self.pending_ack_request && self.unacked.len() >= self.config.window_size as usize
    }

    /// Route an inbound unit.
    ///
    /// Returns `true` when the unit belonged to stream management and was
    /// consumed here; stanzas are counted and returned as `false` for the
    /// application to handle.
    pub fn on_unit(&mut self, unit: &Unit) -> Result<bool, SmError> {
        match unit {
            Unit::Enabled { id, .. } => self.on_enabled(id.clone()),
            Unit::Resumed { previd, h } => self.on_resumed(previd.clone(), *h)?,
            Unit::Failed => self.on_failed(),
            Unit::Ack { h } => self.process_ack(*h, false)?,
            Unit::Request => self.send_ack()?,
            Unit::Enable { .. } | Unit::Resume { .. } => {
                warn!("Ignoring client-side {} unit from peer", unit.kind());
            }
            Unit::Message(_) | Unit::Presence(_) | Unit::Iq(_) => {
                self.handle_inbound();
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Derived handshake state
    pub fn state(&self) -> SmState {
        match (self.inbound_active, self.outbound_active) {
            (true, true) => SmState::Started,
            (false, false) => SmState::Disabled,
            _ => SmState::HalfOpen,
        }
    }

    /// Whether both directions are active
    pub fn is_started(&self) -> bool {
        self.inbound_active && self.outbound_active
    }

    /// Whether inbound units are being counted
    pub fn inbound_active(&self) -> bool {
        self.inbound_active
    }

    /// Whether outbound units are being tracked
    pub fn outbound_active(&self) -> bool {
        self.outbound_active
    }

    /// Whether a resumption id is held
    pub fn is_resumable(&self) -> bool {
        self.resumption_id.is_some()
    }

    /// Resumption id granted by the peer
    pub fn resumption_id(&self) -> Option<&str> {
        self.resumption_id.as_deref()
    }

    /// Last handled count acknowledged by the peer
    pub fn last_ack(&self) -> u32 {
        self.last_ack
    }

    /// Inbound units handled
    pub fn handled(&self) -> u32 {
        self.handled
    }

    /// Whether an ack request is outstanding
    pub fn pending_ack_request(&self) -> bool {
        self.pending_ack_request
    }

    /// Number of unacked units
    pub fn unacked_len(&self) -> usize {
        self.unacked.len()
    }

    /// Unacked units, oldest first
    pub fn unacked(&self) -> impl Iterator<Item = &Unit> {
        self.unacked.iter().map(|entry| &entry.unit)
    }

    /// Active configuration
    pub fn config(&self) -> &SmConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelEndpoints, ChannelTransport};
    use serde_json::json;
    use sm_storage::{MemoryStore, PersistedEntry};
    use sm_wire::{Stanza, WireError};

    const OWNER: &str = "alice@example.org/phone";

    struct Harness {
        sm: StreamManagement,
        endpoints: ChannelEndpoints,
        store: MemoryStore,
    }

    impl Harness {
        fn new(config: SmConfig) -> Self {
            Self::with_store(config, MemoryStore::new())
        }

        fn with_store(config: SmConfig, store: MemoryStore) -> Self {
            Self::try_with_store(config, store).unwrap()
        }

        fn try_with_store(config: SmConfig, store: MemoryStore) -> Result<Self, SmError> {
            let (transport, endpoints) = ChannelTransport::new();
            let io = Collaborators::new(transport.clone(), transport).with_store(store.clone());
            Ok(Self {
                sm: StreamManagement::new(config, io)?,
                endpoints,
                store,
            })
        }

        fn sent(&mut self) -> Vec<Unit> {
            let mut out = Vec::new();
            while let Ok(unit) = self.endpoints.units.try_recv() {
                out.push(unit);
            }
            out
        }

        fn acked(&mut self) -> Vec<Unit> {
            let mut out = Vec::new();
            while let Ok(SmEvent::Acknowledged(unit)) = self.endpoints.events.try_recv() {
                out.push(unit);
            }
            out
        }

        fn unacked(&self) -> Vec<Unit> {
            self.sm.unacked().cloned().collect()
        }

        /// Enable and accept, draining the handshake units
        fn started(config: SmConfig) -> Self {
            let mut h = Self::new(config);
            h.sm.enable().unwrap();
            h.sm.on_enabled(Some("sid-1".to_string()));
            h.sent();
            h
        }
    }

    fn config() -> SmConfig {
        SmConfig {
            owner: OWNER.to_string(),
            ..SmConfig::default()
        }
    }

    fn msg(id: &str) -> Unit {
        Unit::Message(Stanza::new(id, "body"))
    }

    fn stored(id: &str, last_ack: u32, handled: u32, queue: &[&str]) -> Snapshot {
        Snapshot {
            owner: OWNER.to_string(),
            resumption_id: Some(id.to_string()),
            last_ack: Some(last_ack),
            handled: Some(handled),
            queue: queue
                .iter()
                .map(|id| PersistedEntry {
                    kind: "message".to_string(),
                    unit: serde_json::to_value(Stanza::new(*id, "body")).unwrap(),
                })
                .collect(),
        }
    }

    #[test]
    fn test_enable() {
        let mut h = Harness::new(config());
        assert_eq!(h.sm.state(), SmState::Disabled);

        h.sm.enable().unwrap();

        assert_eq!(h.sent(), vec![Unit::Enable { resume: true }]);
        assert_eq!(h.sm.handled(), 0);
        assert!(h.sm.outbound_active());
        assert!(!h.sm.inbound_active());
        assert_eq!(h.sm.state(), SmState::HalfOpen);

        h.sm.on_enabled(Some("sid-1".to_string()));
        assert_eq!(h.sm.state(), SmState::Started);
        assert!(h.sm.is_started());
        assert_eq!(h.sm.resumption_id(), Some("sid-1"));
    }

    #[test]
    fn test_enable_without_resume() {
        let mut h = Harness::new(SmConfig {
            allow_resume: false,
            ..config()
        });
        h.sm.enable().unwrap();
        assert_eq!(h.sent(), vec![Unit::Enable { resume: false }]);

        h.sm.on_enabled(None);
        assert!(h.sm.is_started());
        assert!(!h.sm.is_resumable());
    }

    #[test]
    fn test_basic_ack() {
        let mut h = Harness::started(config());

        assert!(h.sm.track_outbound(&msg("m1")).unwrap());
        assert_eq!(h.unacked(), vec![msg("m1")]);
        assert_eq!(h.sent(), vec![Unit::Request]);
        assert!(h.sm.pending_ack_request());

        h.sm.process_ack(1, false).unwrap();

        assert_eq!(h.acked(), vec![msg("m1")]);
        assert_eq!(h.sm.last_ack(), 1);
        assert!(!h.sm.pending_ack_request());
        assert_eq!(h.sm.unacked_len(), 0);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_track_outbound_ignored() {
        let mut h = Harness::new(config());

        // Outbound tracking not started yet
        assert!(!h.sm.track_outbound(&msg("m1")).unwrap());
        assert_eq!(h.sm.unacked_len(), 0);

        h.sm.enable().unwrap();
        h.sent();

        // Control units are never tracked
        assert!(!h.sm.track_outbound(&Unit::Ack { h: 4 }).unwrap());
        assert!(!h.sm.track_outbound(&Unit::Request).unwrap());
        assert_eq!(h.sm.unacked_len(), 0);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_track_outbound_respects_trackable_set() {
        let mut h = Harness::started(SmConfig {
            trackable: TrackableKinds::MESSAGE,
            ..config()
        });

        assert!(!h.sm.track_outbound(&Unit::Presence(Stanza::default())).unwrap());
        assert!(h.sm.track_outbound(&msg("m1")).unwrap());
        assert_eq!(h.unacked(), vec![msg("m1")]);
    }

    #[test]
    fn test_window_size() {
        let mut h = Harness::started(SmConfig {
            window_size: 3,
            ..config()
        });

        h.sm.track_outbound(&msg("m1")).unwrap();
        h.sm.track_outbound(&msg("m2")).unwrap();
        assert!(!h.sm.need_ack_request());
        assert!(h.sent().is_empty());

        h.sm.track_outbound(&msg("m3")).unwrap();
        assert_eq!(h.sent(), vec![Unit::Request]);

        // Already pending: the window being exceeded sends nothing more
        h.sm.track_outbound(&msg("m4")).unwrap();
        assert!(!h.sm.need_ack_request());
        assert!(h.sent().is_empty());

        // Ack covers two; two remain, below the window
        h.sm.process_ack(2, false).unwrap();
        assert_eq!(h.acked(), vec![msg("m1"), msg("m2")]);
        assert_eq!(h.unacked(), vec![msg("m3"), msg("m4")]);
        assert!(h.sent().is_empty());
    }

    #[test]
    fn test_ack_request_guard() {
        let mut h = Harness::started(config());

        h.sm.send_ack_request().unwrap();
        h.sm.send_ack_request().unwrap();
        assert_eq!(h.sent(), vec![Unit::Request]);

        // Acks clear the guard even when they cover nothing
        h.sm.process_ack(0, false).unwrap();
        assert!(!h.sm.pending_ack_request());
        h.sm.send_ack_request().unwrap();
        assert_eq!(h.sent(), vec![Unit::Request]);
    }

    #[test]
    fn test_send_ack() {
        let mut h = Harness::started(config());
        h.sm.send_ack_request().unwrap();
        for _ in 0..3 {
            h.sm.handle_inbound();
        }
        h.sent();

        h.sm.send_ack().unwrap();

        assert_eq!(h.sent(), vec![Unit::Ack { h: 3 }]);
        assert!(h.sm.pending_ack_request());
    }

    #[test]
    fn test_ack_beyond_queue_is_tolerated() {
        let mut h = Harness::started(SmConfig {
            window_size: 10,
            ..config()
        });
        h.sm.track_outbound(&msg("m1")).unwrap();
        h.sm.track_outbound(&msg("m2")).unwrap();

        h.sm.process_ack(5, false).unwrap();

        assert_eq!(h.acked(), vec![msg("m1"), msg("m2")]);
        assert_eq!(h.sm.unacked_len(), 0);
        assert_eq!(h.sm.last_ack(), 5);
    }

    #[test]
    fn test_ack_across_wrap() {
        let store = MemoryStore::with_snapshot(stored(
            "sid-9",
            4294967294,
            0,
            &["m1", "m2", "m3", "m4"],
        ));
        let mut h = Harness::with_store(
            SmConfig {
                window_size: 10,
                ..config()
            },
            store,
        );

        h.sm.process_ack(1, false).unwrap();

        assert_eq!(h.acked(), vec![msg("m1"), msg("m2"), msg("m3")]);
        assert_eq!(h.unacked(), vec![msg("m4")]);
        assert_eq!(h.sm.last_ack(), 1);
    }

    #[test]
    fn test_resumption_replay() {
        let store = MemoryStore::with_snapshot(stored("xyz", 10, 7, &["u11", "u12"]));
        let mut h = Harness::with_store(config(), store);
        assert!(h.sm.is_resumable());
        assert_eq!(h.sm.state(), SmState::Disabled);

        h.sm.resume().unwrap();
        assert_eq!(
            h.sent(),
            vec![Unit::Resume {
                h: 7,
                previd: "xyz".to_string()
            }]
        );

        h.sm.on_resumed("xyz".to_string(), Some(11)).unwrap();

        assert_eq!(h.acked(), vec![msg("u11")]);
        // u12 goes out again, then the window triggers a request for it
        assert_eq!(h.sent(), vec![msg("u12"), Unit::Request]);
        assert_eq!(h.unacked(), vec![msg("u12")]);
        assert_eq!(h.sm.last_ack(), 11);
        assert!(h.sm.is_started());

        let persisted = h.store.current().unwrap();
        assert_eq!(persisted.last_ack, Some(11));
        assert_eq!(persisted.queue.len(), 1);
    }

    #[test]
    fn test_resumed_replays_everything_in_order() {
        let store = MemoryStore::with_snapshot(stored("xyz", 3, 0, &["a", "b", "c", "d"]));
        let mut h = Harness::with_store(
            SmConfig {
                window_size: 8,
                ..config()
            },
            store,
        );
        h.sm.resume().unwrap();
        h.sent();

        h.sm.on_resumed("xyz".to_string(), Some(4)).unwrap();

        assert_eq!(h.acked(), vec![msg("a")]);
        assert_eq!(h.sent(), vec![msg("b"), msg("c"), msg("d")]);
        assert_eq!(h.unacked(), vec![msg("b"), msg("c"), msg("d")]);
    }

    #[test]
    fn test_resumed_without_count() {
        let store = MemoryStore::with_snapshot(stored("xyz", 2, 5, &["u3"]));
        let mut h = Harness::with_store(config(), store);
        h.sm.resume().unwrap();
        h.sent();

        h.sm.on_resumed("xyz".to_string(), None).unwrap();

        assert!(h.sent().is_empty());
        assert!(h.acked().is_empty());
        assert_eq!(h.unacked(), vec![msg("u3")]);
        assert!(h.sm.is_started());
    }

    #[test]
    fn test_resume_requires_id() {
        let mut h = Harness::new(config());
        assert!(matches!(h.sm.resume(), Err(SmError::NotResumable)));
        assert!(h.sent().is_empty());
        assert!(!h.sm.outbound_active());
    }

    #[test]
    fn test_handled_wraps() {
        let store = MemoryStore::with_snapshot(stored("xyz", 0, u32::MAX, &[]));
        let mut h = Harness::with_store(config(), store);
        h.sm.resume().unwrap();
        h.sm.on_resumed("xyz".to_string(), None).unwrap();

        h.sm.handle_inbound();

        assert_eq!(h.sm.handled(), 0);
        assert_eq!(h.store.current().unwrap().handled, Some(0));
    }

    #[test]
    fn test_handle_inbound_requires_inbound() {
        let mut h = Harness::new(config());
        h.sm.enable().unwrap();
        h.sm.handle_inbound();
        assert_eq!(h.sm.handled(), 0);

        h.sm.on_enabled(Some("sid".to_string()));
        h.sm.handle_inbound();
        h.sm.handle_inbound();
        assert_eq!(h.sm.handled(), 2);
    }

    #[test]
    fn test_on_failed_resets_everything() {
        let mut h = Harness::started(SmConfig {
            window_size: 10,
            ..config()
        });
        h.sm.track_outbound(&msg("m1")).unwrap();
        h.sm.send_ack_request().unwrap();
        h.sm.handle_inbound();
        h.sm.process_ack(1, false).unwrap();
        h.sm.track_outbound(&msg("m2")).unwrap();

        h.sm.on_failed();

        assert_eq!(h.sm.state(), SmState::Disabled);
        assert!(h.sm.resumption_id().is_none());
        assert_eq!(h.sm.last_ack(), 0);
        assert_eq!(h.sm.handled(), 0);
        assert_eq!(h.sm.unacked_len(), 0);
        assert!(!h.sm.pending_ack_request());
        assert_eq!(h.store.clear_count(), 1);
        assert!(h.store.current().is_none());

        // Again, from the disabled state
        h.sm.on_failed();
        assert_eq!(h.store.clear_count(), 2);
        assert_eq!(h.sm.state(), SmState::Disabled);
    }

    #[test]
    fn test_teardown_keeps_resumable_state() {
        let mut h = Harness::started(SmConfig {
            window_size: 10,
            ..config()
        });
        h.sm.track_outbound(&msg("m1")).unwrap();
        h.sm.handle_inbound();

        h.sm.teardown();

        assert_eq!(h.sm.state(), SmState::Disabled);
        assert_eq!(h.sm.resumption_id(), Some("sid-1"));
        assert_eq!(h.sm.handled(), 1);
        assert_eq!(h.unacked(), vec![msg("m1")]);

        // Nothing is tracked while down
        assert!(!h.sm.track_outbound(&msg("m2")).unwrap());

        h.sm.resume().unwrap();
        assert_eq!(
            h.sent(),
            vec![Unit::Resume {
                h: 1,
                previd: "sid-1".to_string()
            }]
        );
    }

    #[test]
    fn test_teardown_drops_outstanding_request() {
        let mut h = Harness::started(config());
        h.sm.track_outbound(&msg("m1")).unwrap();
        assert_eq!(h.sent(), vec![Unit::Request]);
        assert!(h.sm.pending_ack_request());

        h.sm.teardown();
        assert!(!h.sm.pending_ack_request());

        h.sm.resume().unwrap();
        h.sm.on_resumed("sid-1".to_string(), None).unwrap();
        h.sent();

        // Flow control still works on the resumed stream
        assert!(h.sm.track_outbound(&msg("m2")).unwrap());
        assert_eq!(h.sent(), vec![Unit::Request]);
        assert_eq!(h.unacked(), vec![msg("m1"), msg("m2")]);
    }

    #[test]
    fn test_enable_keeps_inbound_state() {
        let mut h = Harness::started(config());
        h.sm.handle_inbound();
        h.sm.handle_inbound();

        h.sm.enable().unwrap();

        assert_eq!(h.sent(), vec![Unit::Enable { resume: true }]);
        assert_eq!(h.sm.handled(), 0);
        assert!(h.sm.inbound_active());
        assert!(h.sm.outbound_active());
        assert_eq!(h.sm.state(), SmState::Started);
    }

    #[test]
    fn test_enabled_persists_new_stream() {
        let store = MemoryStore::with_snapshot(stored("old-sid", 10, 7, &["u11"]));
        let mut h = Harness::with_store(config(), store);
        assert_eq!(h.sm.resumption_id(), Some("old-sid"));

        h.sm.enable().unwrap();
        h.sm.on_enabled(Some("sid-2".to_string()));

        let persisted = h.store.current().unwrap();
        assert_eq!(persisted.resumption_id.as_deref(), Some("sid-2"));
        assert_eq!(persisted.handled, Some(0));
    }

    #[test]
    fn test_restore_rejects_untrackable_entry() {
        let mut snapshot = stored("xyz", 10, 7, &["u11"]);
        snapshot.queue.push(PersistedEntry {
            kind: "iq".to_string(),
            unit: json!({ "id": "q1" }),
        });

        let err = Harness::try_with_store(
            SmConfig {
                trackable: TrackableKinds::MESSAGE,
                ..config()
            },
            MemoryStore::with_snapshot(snapshot),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            SmError::RestoreCorrupted {
                index: 1,
                source: WireError::Untrackable(_)
            }
        ));
    }

    #[test]
    fn test_save_restore_roundtrip() {
        let store = MemoryStore::new();
        let mut h = Harness::with_store(
            SmConfig {
                window_size: 10,
                ..config()
            },
            store.clone(),
        );
        h.sm.enable().unwrap();
        h.sm.on_enabled(Some("sid-7".to_string()));
        h.sm.track_outbound(&msg("m1")).unwrap();
        h.sm.track_outbound(&Unit::Iq(Stanza::new("q1", "query").to("example.org")))
            .unwrap();
        h.sm.track_outbound(&Unit::Presence(Stanza::default())).unwrap();
        h.sm.process_ack(1, false).unwrap();
        h.sm.handle_inbound();
        h.sm.handle_inbound();

        let restored = Harness::with_store(config(), store);

        assert_eq!(restored.sm.resumption_id(), Some("sid-7"));
        assert_eq!(restored.sm.last_ack(), 1);
        assert_eq!(restored.sm.handled(), 2);
        assert_eq!(restored.unacked(), h.unacked());
        assert_eq!(restored.sm.state(), SmState::Disabled);
    }

    #[test]
    fn test_restore_incomplete_snapshot() {
        let mut snapshot = stored("xyz", 10, 7, &["u11"]);
        snapshot.last_ack = None;
        let h = Harness::with_store(config(), MemoryStore::with_snapshot(snapshot));

        assert!(!h.sm.is_resumable());
        assert_eq!(h.sm.last_ack(), 0);
        assert_eq!(h.sm.handled(), 0);
        assert_eq!(h.sm.unacked_len(), 0);
        assert_eq!(h.sm.state(), SmState::Disabled);
    }

    #[test]
    fn test_restore_other_owner_ignored() {
        let mut snapshot = stored("xyz", 10, 7, &["u11"]);
        snapshot.owner = "bob@example.org".to_string();
        let h = Harness::with_store(config(), MemoryStore::with_snapshot(snapshot));

        assert!(!h.sm.is_resumable());
        assert_eq!(h.sm.unacked_len(), 0);
    }

    #[test]
    fn test_restore_corrupted_queue() {
        let mut snapshot = stored("xyz", 10, 7, &["u11"]);
        snapshot.queue.push(PersistedEntry {
            kind: "message".to_string(),
            unit: json!({ "to": ["not", "a", "jid"] }),
        });

        let err = Harness::try_with_store(config(), MemoryStore::with_snapshot(snapshot))
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SmError::RestoreCorrupted {
                index: 1,
                source: WireError::Malformed { .. }
            }
        ));
    }

    #[test]
    fn test_zero_window_rejected() {
        let err = Harness::try_with_store(
            SmConfig {
                window_size: 0,
                ..config()
            },
            MemoryStore::new(),
        )
        .err()
        .unwrap();
        assert!(matches!(err, SmError::Config(_)));
    }

    #[test]
    fn test_send_tracks_then_requests() {
        let mut h = Harness::started(config());

        h.sm.send(msg("m1")).unwrap();
        h.sm.send(Unit::Ack { h: 0 }).unwrap();

        assert_eq!(h.sent(), vec![msg("m1"), Unit::Request, Unit::Ack { h: 0 }]);
        assert_eq!(h.unacked(), vec![msg("m1")]);
    }

    #[test]
    fn test_on_unit_dispatch() {
        let mut h = Harness::new(config());
        h.sm.enable().unwrap();
        h.sent();

        assert!(h
            .sm
            .on_unit(&Unit::Enabled {
                id: Some("sid-2".to_string()),
                resume: true
            })
            .unwrap());
        assert!(h.sm.is_started());

        assert!(!h.sm.on_unit(&msg("in-1")).unwrap());
        assert!(!h.sm.on_unit(&Unit::Presence(Stanza::default())).unwrap());
        assert!(h.sm.on_unit(&Unit::Request).unwrap());
        assert_eq!(h.sent(), vec![Unit::Ack { h: 2 }]);

        h.sm.send(msg("out-1")).unwrap();
        assert!(h.sm.on_unit(&Unit::Ack { h: 1 }).unwrap());
        assert_eq!(h.acked(), vec![msg("out-1")]);

        assert!(h.sm.on_unit(&Unit::Failed).unwrap());
        assert_eq!(h.sm.state(), SmState::Disabled);
        assert!(!h.sm.is_resumable());
    }

    #[test]
    fn test_transport_failure_surfaces() {
        let (transport, endpoints) = ChannelTransport::new();
        drop(endpoints);
        let io = Collaborators::new(transport.clone(), transport);
        let mut sm = StreamManagement::new(config(), io).unwrap();

        assert!(matches!(sm.enable(), Err(SmError::Transport(_))));
        assert!(!sm.outbound_active());
    }

    #[test]
    fn test_every_mutation_persists() {
        let mut h = Harness::started(SmConfig {
            window_size: 10,
            ..config()
        });
        let before = h.store.save_count();

        h.sm.track_outbound(&msg("m1")).unwrap();
        h.sm.handle_inbound();
        h.sm.process_ack(1, false).unwrap();

        assert_eq!(h.store.save_count(), before + 3);
    }
}
