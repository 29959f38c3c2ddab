//! `PeerSession` - negotiation state and owned resources of one connection.
//!
//! The session is owned by the peer's connection task and only ever mutated
//! there, so it needs no interior locking. Room-driven cascades reach it as
//! events on the peer's channel, applied by the same task.
//!
//! Phase is derived: `InRoom` means both room membership and device
//! readiness, which may be established in either order (clients typically
//! join first and load the device from the returned capabilities).

use std::collections::HashMap;

use media_engine::{ConsumerId, MediaKind, ProducerId, RtpCapabilities, TransportId};

use crate::errors::SignalError;
use crate::protocol::PeerId;
use crate::transport::TransportRecord;

/// Observable lifecycle phase of a peer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Signaling connection established, nothing negotiated yet.
    Connected,
    /// Device capabilities validated against the router.
    DeviceReady,
    /// Room member with a ready device; transports may be created.
    InRoom,
    /// Teardown cascade in progress.
    Leaving,
    /// Terminal.
    Disconnected,
}

/// One media stream the peer sends.
#[derive(Debug)]
pub struct ProducerRecord {
    pub id: ProducerId,
    pub transport_id: TransportId,
    pub kind: MediaKind,
    pub paused: bool,
}

/// One media stream the peer receives. Holds only the producer's id: the
/// producer belongs to another session and may die first.
#[derive(Debug)]
pub struct ConsumerRecord {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub transport_id: TransportId,
}

/// Negotiation state and owned resources of one signaling connection.
pub struct PeerSession {
    peer_id: PeerId,
    device_capabilities: Option<RtpCapabilities>,
    room_id: Option<String>,
    leaving: bool,
    disconnected: bool,
    transports: HashMap<TransportId, TransportRecord>,
    producers: HashMap<ProducerId, ProducerRecord>,
    consumers: HashMap<ConsumerId, ConsumerRecord>,
}

impl PeerSession {
    #[must_use]
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            peer_id,
            device_capabilities: None,
            room_id: None,
            leaving: false,
            disconnected: false,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    #[must_use]
    pub fn peer_id(&self) -> PeerId {
        self.peer_id
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        if self.disconnected {
            SessionPhase::Disconnected
        } else if self.leaving {
            SessionPhase::Leaving
        } else if self.room_id.is_some() && self.device_capabilities.is_some() {
            SessionPhase::InRoom
        } else if self.device_capabilities.is_some() {
            SessionPhase::DeviceReady
        } else {
            SessionPhase::Connected
        }
    }

    /// Validate and store the device's capability descriptor. Fails with
    /// `IncompatibleCapabilities` (no mutation) when the codec intersection
    /// with the router is empty.
    pub fn set_device_capabilities(
        &mut self,
        offered: RtpCapabilities,
        router: &RtpCapabilities,
    ) -> Result<(), SignalError> {
        self.ensure_active("initDevice")?;
        if !router.is_compatible_with(&offered) {
            return Err(SignalError::IncompatibleCapabilities);
        }
        self.device_capabilities = Some(offered);
        Ok(())
    }

    #[must_use]
    pub fn device_capabilities(&self) -> Option<&RtpCapabilities> {
        self.device_capabilities.as_ref()
    }

    /// Record room membership. Idempotent for the same room; joining a
    /// second room requires an explicit leave first.
    pub fn join_room(&mut self, room_id: &str) -> Result<(), SignalError> {
        self.ensure_active("joinRoom")?;
        match &self.room_id {
            Some(current) if current == room_id => Ok(()),
            Some(current) => Err(SignalError::AlreadyInRoom(current.clone())),
            None => {
                self.room_id = Some(room_id.to_string());
                Ok(())
            }
        }
    }

    #[must_use]
    pub fn room_id(&self) -> Option<&str> {
        self.room_id.as_deref()
    }

    /// Drop room membership, returning the room left (if any). The session
    /// falls back to `DeviceReady`/`Connected` and may join again.
    pub fn leave_room(&mut self) -> Option<String> {
        self.leaving = false;
        self.room_id.take()
    }

    /// Mark the teardown cascade as in progress.
    pub fn begin_leaving(&mut self) {
        if !self.disconnected {
            self.leaving = true;
        }
    }

    /// Terminal: the connection is gone.
    pub fn mark_disconnected(&mut self) {
        self.disconnected = true;
    }

    /// Guard for operations that require full `InRoom` readiness.
    pub fn ensure_in_room(&self) -> Result<(), SignalError> {
        match self.phase() {
            SessionPhase::InRoom => Ok(()),
            SessionPhase::Connected => Err(SignalError::PeerNotReady(
                "join a room and initialize the device first".to_string(),
            )),
            SessionPhase::DeviceReady => Err(SignalError::PeerNotReady(
                "join a room first".to_string(),
            )),
            SessionPhase::Leaving | SessionPhase::Disconnected => {
                Err(SignalError::PeerNotReady("session is closing".to_string()))
            }
        }
    }

    fn ensure_active(&self, operation: &str) -> Result<(), SignalError> {
        if self.leaving || self.disconnected {
            return Err(SignalError::PeerNotReady(format!(
                "{operation} not possible while the session is closing"
            )));
        }
        Ok(())
    }

    // --- owned transports ---

    pub fn insert_transport(&mut self, transport: TransportRecord) {
        self.transports.insert(transport.id(), transport);
    }

    #[must_use]
    pub fn transport(&self, id: TransportId) -> Option<&TransportRecord> {
        self.transports.get(&id)
    }

    pub fn transport_mut(&mut self, id: TransportId) -> Result<&mut TransportRecord, SignalError> {
        self.transports
            .get_mut(&id)
            .ok_or_else(|| SignalError::TransportNotFound(id.to_string()))
    }

    pub fn remove_transport(&mut self, id: TransportId) -> Option<TransportRecord> {
        self.transports.remove(&id)
    }

    #[must_use]
    pub fn transport_ids(&self) -> Vec<TransportId> {
        self.transports.keys().copied().collect()
    }

    #[must_use]
    pub fn transport_count(&self) -> usize {
        self.transports.len()
    }

    // --- owned producers ---

    pub fn add_producer(&mut self, producer: ProducerRecord) {
        self.producers.insert(producer.id, producer);
    }

    pub fn producer_mut(&mut self, id: ProducerId) -> Result<&mut ProducerRecord, SignalError> {
        self.producers
            .get_mut(&id)
            .ok_or_else(|| SignalError::ProducerNotFound(id.to_string()))
    }

    pub fn remove_producer(&mut self, id: ProducerId) -> Result<ProducerRecord, SignalError> {
        self.producers
            .remove(&id)
            .ok_or_else(|| SignalError::ProducerNotFound(id.to_string()))
    }

    #[must_use]
    pub fn producers_on_transport(&self, transport_id: TransportId) -> Vec<ProducerId> {
        self.producers
            .values()
            .filter(|p| p.transport_id == transport_id)
            .map(|p| p.id)
            .collect()
    }

    #[must_use]
    pub fn producer_count(&self) -> usize {
        self.producers.len()
    }

    // --- owned consumers ---

    pub fn add_consumer(&mut self, consumer: ConsumerRecord) {
        self.consumers.insert(consumer.id, consumer);
    }

    pub fn remove_consumer(&mut self, id: ConsumerId) -> Option<ConsumerRecord> {
        self.consumers.remove(&id)
    }

    #[must_use]
    pub fn consumers_on_transport(&self, transport_id: TransportId) -> Vec<ConsumerId> {
        self.consumers
            .values()
            .filter(|c| c.transport_id == transport_id)
            .map(|c| c.id)
            .collect()
    }

    #[must_use]
    pub fn consumers_of_producer(&self, producer_id: ProducerId) -> Vec<ConsumerId> {
        self.consumers
            .values()
            .filter(|c| c.producer_id == producer_id)
            .map(|c| c.id)
            .collect()
    }

    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }
}
