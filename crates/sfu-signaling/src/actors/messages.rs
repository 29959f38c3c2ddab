//! Message types for the actor system.

use media_engine::{
    ConsumerDescriptor, ConsumerId, MediaKind, ProducerId, RtpCapabilities, TransportId,
};
use tokio::sync::{mpsc, oneshot};

use crate::errors::SignalError;
use crate::protocol::{PeerId, ProducerSnapshot};

/// An engine-paired consumer granted to a peer, together with the receive
/// transport it was created on.
#[derive(Debug, Clone)]
pub struct ConsumerGrant {
    pub descriptor: ConsumerDescriptor,
    pub transport_id: TransportId,
}

/// Pushes a room sends to member peers over their event channels.
///
/// Delivery is at-least-once; peers treat duplicates as harmless.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    /// A producer appeared. `grant` is present when the member held a ready
    /// receive context and was eagerly paired.
    ProducerAvailable {
        producer_id: ProducerId,
        peer_id: PeerId,
        kind: MediaKind,
        grant: Option<ConsumerGrant>,
    },
    /// A producer went away. `consumer_id` names the member's consumer that
    /// was closed server-side, if it held one.
    ProducerClosed {
        producer_id: ProducerId,
        consumer_id: Option<ConsumerId>,
    },
}

/// Messages handled by a `RoomActor`.
pub enum RoomMessage {
    /// A peer joins the room. Idempotent for an existing member.
    Join {
        peer_id: PeerId,
        events: mpsc::Sender<RoomEvent>,
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },
    /// A peer leaves. Responds with whether the room is now empty.
    Leave {
        peer_id: PeerId,
        respond_to: oneshot::Sender<bool>,
    },
    /// The peer's receive side is ready: a connected recv transport plus
    /// its device capabilities. Enables eager pairing.
    SetConsumeContext {
        peer_id: PeerId,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
    },
    /// The peer's receive transport went away.
    ClearConsumeContext {
        peer_id: PeerId,
        transport_id: TransportId,
    },
    /// Add a producer to the room index and fan out pairing.
    RegisterProducer {
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },
    /// Remove a producer; closes every referencing consumer room-wide
    /// before responding.
    UnregisterProducer {
        peer_id: PeerId,
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<(), SignalError>>,
    },
    /// Toggle the pause flag in the room's producer index.
    SetProducerPaused {
        producer_id: ProducerId,
        paused: bool,
    },
    /// Pull-pair a consumer for a named producer. Idempotent per
    /// (peer, producer).
    Consume {
        peer_id: PeerId,
        producer_id: ProducerId,
        respond_to: oneshot::Sender<Result<ConsumerGrant, SignalError>>,
    },
    /// A peer-side cascade closed a consumer; release the room's binding
    /// and the engine handle.
    ReleaseConsumer {
        peer_id: PeerId,
        consumer_id: ConsumerId,
    },
    /// Point-in-time snapshot of the producer index.
    ListProducers {
        respond_to: oneshot::Sender<Vec<ProducerSnapshot>>,
    },
    /// Current member count.
    MemberCount {
        respond_to: oneshot::Sender<usize>,
    },
}

/// Successful join: the router capabilities plus a handle to the room.
pub struct JoinOutcome {
    pub rtp_capabilities: RtpCapabilities,
    pub room: super::room::RoomActorHandle,
}

/// Registry status snapshot.
#[derive(Debug, Clone, Copy)]
pub struct RegistryStatus {
    pub active_rooms: usize,
}

/// Messages handled by the `RoomRegistryActor`.
pub enum RegistryMessage {
    /// Route a peer into a room, creating the room actor if needed.
    JoinRoom {
        room_id: String,
        peer_id: PeerId,
        events: mpsc::Sender<RoomEvent>,
        respond_to: oneshot::Sender<Result<JoinOutcome, SignalError>>,
    },
    /// Registry status for observability.
    GetStatus {
        respond_to: oneshot::Sender<RegistryStatus>,
    },
}
