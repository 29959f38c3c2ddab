//! The abstract capability-negotiation and transport-creation interface the
//! signaling core consumes.
//!
//! The orchestrator treats the engine as stateless beyond the handles it
//! returns: every call either succeeds, or fails with a [`MediaEngineError`]
//! that the caller translates into a negotiation failure and, where a
//! resource was partially created, pairs with a close to avoid orphans.

use async_trait::async_trait;
use thiserror::Error;

use crate::types::{
    ConsumerDescriptor, ConsumerId, DtlsParameters, MediaKind, ProducerId, RouterId,
    RtpCapabilities, RtpCodecCapability, RtpParameters, TransportDescriptor, TransportId,
};

/// Failures reported by the media engine.
#[derive(Debug, Error)]
pub enum MediaEngineError {
    /// The referenced handle is unknown to the engine.
    #[error("unknown handle: {0}")]
    UnknownHandle(String),

    /// The referenced handle exists but has already been closed.
    #[error("handle already closed: {0}")]
    Closed(String),

    /// The engine rejected the supplied parameters.
    #[error("parameters rejected: {0}")]
    Rejected(String),

    /// Engine-internal failure.
    #[error("engine failure: {0}")]
    Internal(String),
}

/// Boundary to the media plane.
///
/// Close operations are idempotent: closing an already-closed (or cascaded
/// away) resource succeeds, so explicit teardown walks and engine-internal
/// cascades can overlap safely.
#[async_trait]
pub trait MediaEngineAdapter: Send + Sync {
    /// Create a router for the given codec set and return its id together
    /// with the capability descriptor clients initialize their devices from.
    async fn create_router(
        &self,
        media_codecs: Vec<RtpCodecCapability>,
    ) -> Result<(RouterId, RtpCapabilities), MediaEngineError>;

    /// Allocate a transport on the router: ICE candidates, ICE credentials
    /// and the server DTLS fingerprint.
    async fn create_transport(
        &self,
        router_id: RouterId,
    ) -> Result<TransportDescriptor, MediaEngineError>;

    /// Complete the DTLS handshake for a transport. Valid exactly once per
    /// transport; the orchestrator guards idempotent client retries before
    /// calling in.
    async fn connect_transport(
        &self,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<(), MediaEngineError>;

    /// Create a producer on a connected transport.
    async fn create_producer(
        &self,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, MediaEngineError>;

    /// Pair a consumer on a connected transport with an existing producer,
    /// negotiated against the consuming device's capabilities.
    async fn create_consumer(
        &self,
        transport_id: TransportId,
        producer_id: ProducerId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<ConsumerDescriptor, MediaEngineError>;

    /// Release a transport and every producer/consumer bound to it.
    async fn close_transport(&self, transport_id: TransportId) -> Result<(), MediaEngineError>;

    /// Release a producer.
    async fn close_producer(&self, producer_id: ProducerId) -> Result<(), MediaEngineError>;

    /// Release a consumer.
    async fn close_consumer(&self, consumer_id: ConsumerId) -> Result<(), MediaEngineError>;
}
