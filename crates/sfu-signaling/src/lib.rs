//! Signaling core for an SFU-based conferencing service.
//!
//! The core orchestrates session and resource lifecycle around an external
//! media engine: room membership, capability negotiation, transport
//! establishment (ICE/DTLS parameter exchange), and producer/consumer
//! pairing. It never touches media itself.
//!
//! # Architecture
//!
//! An actor hierarchy owns all shared state:
//! - [`actors::RoomRegistryActor`] (singleton): supervises rooms
//! - [`actors::RoomActor`] (per room): owns one room's members and
//!   producer index, and runs the producer/consumer matcher
//!
//! Everything owned by a single peer (its session state machine, its
//! transports, producers and consumers) lives in a [`gateway::PeerConnection`]
//! driven by that peer's connection task; room-driven cascades reach it as
//! events on the peer's channel.
//!
//! The engine boundary is the `MediaEngineAdapter` trait from the
//! `media-engine` crate; the default binary runs against its in-process
//! implementation.

pub mod actors;
pub mod config;
pub mod errors;
pub mod gateway;
pub mod negotiator;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transport;
