//! `TransportNegotiator` - drives transport/producer lifecycle against the
//! media engine.
//!
//! Engine failures are caught here, mapped to negotiation errors, and any
//! partially created resource is closed before the error propagates. Close
//! is an explicit walk of the owning collections: producers and consumers
//! bound to a transport go first (with their room-side bindings), then the
//! engine transport handle is released. The engine's own cascade is a
//! backstop, never the mechanism.

use std::sync::Arc;
use std::time::Duration;

use media_engine::{
    DtlsParameters, MediaEngineAdapter, MediaEngineError, MediaKind, ProducerId, RtpParameters,
    TransportDescriptor, TransportId,
};
use tracing::{debug, warn};

use crate::actors::RoomActorHandle;
use crate::errors::SignalError;
use crate::protocol::TransportDirection;
use crate::router::RouterRegistry;
use crate::session::{PeerSession, ProducerRecord};
use crate::transport::{ConnectDisposition, TransportRecord};

/// How a `connectTransport` request completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// First connect: the engine accepted the DTLS handshake.
    Connected,
    /// Idempotent retry: already connected, no engine call was made.
    AlreadyConnected,
}

/// Orchestrates transport establishment and teardown for peer sessions.
#[derive(Clone)]
pub struct TransportNegotiator {
    adapter: Arc<dyn MediaEngineAdapter>,
    routers: Arc<RouterRegistry>,
    connect_timeout: Duration,
}

impl TransportNegotiator {
    #[must_use]
    pub fn new(
        adapter: Arc<dyn MediaEngineAdapter>,
        routers: Arc<RouterRegistry>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            adapter,
            routers,
            connect_timeout,
        }
    }

    /// Allocate a transport for an in-room, device-ready peer.
    pub async fn create(
        &self,
        session: &mut PeerSession,
        direction: TransportDirection,
    ) -> Result<TransportDescriptor, SignalError> {
        session.ensure_in_room()?;
        let router_id = self.routers.router_id().await?;

        let descriptor = self
            .adapter
            .create_transport(router_id)
            .await
            .map_err(map_transport_error)?;

        session.insert_transport(TransportRecord::new(descriptor.id, direction));
        debug!(
            target: "signal.negotiator",
            peer_id = %session.peer_id(),
            transport_id = %descriptor.id,
            direction = %direction,
            "Transport created"
        );
        Ok(descriptor)
    }

    /// Complete the DTLS handshake for a transport.
    ///
    /// Idempotent on an already-connected transport (no second engine call).
    /// An engine rejection closes the transport and reports
    /// `TransportConnectFailed`; a timeout closes it and fails the peer
    /// (`Disconnected`, caller runs the disconnect cascade).
    pub async fn connect(
        &self,
        session: &mut PeerSession,
        transport_id: TransportId,
        dtls_parameters: DtlsParameters,
    ) -> Result<ConnectOutcome, SignalError> {
        let disposition = session.transport_mut(transport_id)?.begin_connect()?;
        if disposition == ConnectDisposition::AlreadyConnected {
            debug!(
                target: "signal.negotiator",
                peer_id = %session.peer_id(),
                transport_id = %transport_id,
                "Repeat connect absorbed"
            );
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        let attempt = tokio::time::timeout(
            self.connect_timeout,
            self.adapter.connect_transport(transport_id, dtls_parameters),
        )
        .await;

        match attempt {
            Ok(Ok(())) => {
                if let Ok(transport) = session.transport_mut(transport_id) {
                    transport.complete_connect();
                }
                debug!(
                    target: "signal.negotiator",
                    peer_id = %session.peer_id(),
                    transport_id = %transport_id,
                    "Transport connected"
                );
                Ok(ConnectOutcome::Connected)
            }
            Ok(Err(e)) => {
                warn!(
                    target: "signal.negotiator",
                    peer_id = %session.peer_id(),
                    transport_id = %transport_id,
                    error = %e,
                    "Engine rejected transport connect"
                );
                self.abandon_transport(session, transport_id).await;
                Err(SignalError::TransportConnectFailed(e.to_string()))
            }
            Err(_elapsed) => {
                warn!(
                    target: "signal.negotiator",
                    peer_id = %session.peer_id(),
                    transport_id = %transport_id,
                    timeout_secs = self.connect_timeout.as_secs(),
                    "Transport connect timed out, failing peer"
                );
                self.abandon_transport(session, transport_id).await;
                Err(SignalError::Disconnected)
            }
        }
    }

    /// Create a producer on a connected transport.
    pub async fn produce(
        &self,
        session: &mut PeerSession,
        transport_id: TransportId,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> Result<ProducerId, SignalError> {
        {
            let transport = session
                .transport(transport_id)
                .ok_or_else(|| SignalError::TransportNotFound(transport_id.to_string()))?;
            if transport.is_closed() {
                return Err(SignalError::TransportClosed(transport_id.to_string()));
            }
            if !transport.is_connected() {
                return Err(SignalError::PeerNotReady(
                    "transport is not connected".to_string(),
                ));
            }
        }

        let producer_id = self
            .adapter
            .create_producer(transport_id, kind, rtp_parameters)
            .await
            .map_err(map_transport_error)?;

        session.add_producer(ProducerRecord {
            id: producer_id,
            transport_id,
            kind,
            paused: false,
        });
        debug!(
            target: "signal.negotiator",
            peer_id = %session.peer_id(),
            transport_id = %transport_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer created"
        );
        Ok(producer_id)
    }

    /// Close one producer: room unregistration (which closes every
    /// referencing consumer room-wide) before the engine handle goes.
    pub async fn close_producer(
        &self,
        session: &mut PeerSession,
        room: Option<&RoomActorHandle>,
        producer_id: ProducerId,
    ) -> Result<(), SignalError> {
        let record = session.remove_producer(producer_id)?;

        if let Some(room) = room {
            if let Err(e) = room
                .unregister_producer(session.peer_id(), producer_id)
                .await
            {
                warn!(
                    target: "signal.negotiator",
                    peer_id = %session.peer_id(),
                    producer_id = %producer_id,
                    error = %e,
                    "Room unregistration failed during producer close"
                );
            }
        } else {
            // No room to cascade through; close any loopback consumers the
            // session itself holds on this producer.
            for consumer_id in session.consumers_of_producer(producer_id) {
                session.remove_consumer(consumer_id);
                let _ = self.adapter.close_consumer(consumer_id).await;
            }
        }

        if let Err(e) = self.adapter.close_producer(record.id).await {
            warn!(
                target: "signal.negotiator",
                producer_id = %producer_id,
                error = %e,
                "Engine producer close failed"
            );
        }
        Ok(())
    }

    /// Close one transport with a full cascade: owned producers (and their
    /// room-wide consumers), then owned consumers, then the engine handle.
    pub async fn close_transport(
        &self,
        session: &mut PeerSession,
        room: Option<&RoomActorHandle>,
        transport_id: TransportId,
    ) -> Result<(), SignalError> {
        if session.transport(transport_id).is_none() {
            return Err(SignalError::TransportNotFound(transport_id.to_string()));
        }

        for producer_id in session.producers_on_transport(transport_id) {
            self.close_producer(session, room, producer_id).await?;
        }

        for consumer_id in session.consumers_on_transport(transport_id) {
            session.remove_consumer(consumer_id);
            if let Some(room) = room {
                let _ = room.release_consumer(session.peer_id(), consumer_id).await;
            } else {
                let _ = self.adapter.close_consumer(consumer_id).await;
            }
        }

        if let Ok(transport) = session.transport_mut(transport_id) {
            transport.close();
        }
        if let Err(e) = self.adapter.close_transport(transport_id).await {
            warn!(
                target: "signal.negotiator",
                transport_id = %transport_id,
                error = %e,
                "Engine transport close failed"
            );
        }
        debug!(
            target: "signal.negotiator",
            peer_id = %session.peer_id(),
            transport_id = %transport_id,
            "Transport closed"
        );
        Ok(())
    }

    /// The `Leaving` cascade: every owned transport, with everything bound
    /// to it.
    pub async fn teardown(&self, session: &mut PeerSession, room: Option<&RoomActorHandle>) {
        session.begin_leaving();
        for transport_id in session.transport_ids() {
            if let Err(e) = self.close_transport(session, room, transport_id).await {
                warn!(
                    target: "signal.negotiator",
                    peer_id = %session.peer_id(),
                    transport_id = %transport_id,
                    error = %e,
                    "Teardown transport close failed"
                );
            }
            session.remove_transport(transport_id);
        }
    }

    /// A failed connect leaves nothing behind: mark closed, release the
    /// engine handle.
    async fn abandon_transport(&self, session: &mut PeerSession, transport_id: TransportId) {
        if let Ok(transport) = session.transport_mut(transport_id) {
            transport.fail_connect();
        }
        let _ = self.adapter.close_transport(transport_id).await;
    }
}

fn map_transport_error(error: MediaEngineError) -> SignalError {
    match error {
        MediaEngineError::UnknownHandle(handle) => SignalError::TransportNotFound(handle),
        MediaEngineError::Closed(handle) => SignalError::TransportClosed(handle),
        MediaEngineError::Rejected(detail) => SignalError::NegotiationFailed(detail),
        MediaEngineError::Internal(detail) => SignalError::Internal(detail),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use crate::protocol::PeerId;
    use async_trait::async_trait;
    use media_engine::{
        ConsumerDescriptor, ConsumerId, LocalMediaEngine, RouterId, RtpCapabilities,
        RtpCodecCapability, RtpCodecParameters,
    };

    async fn rig() -> (Arc<LocalMediaEngine>, TransportNegotiator) {
        let engine = Arc::new(LocalMediaEngine::new());
        let routers = Arc::new(RouterRegistry::new(
            Arc::clone(&engine) as Arc<dyn MediaEngineAdapter>
        ));
        routers.initialize(default_media_codecs()).await.unwrap();
        let negotiator = TransportNegotiator::new(
            Arc::clone(&engine) as Arc<dyn MediaEngineAdapter>,
            routers,
            Duration::from_secs(2),
        );
        (engine, negotiator)
    }

    fn ready_session() -> PeerSession {
        let caps = RtpCapabilities {
            codecs: default_media_codecs(),
        };
        let mut session = PeerSession::new(PeerId::new());
        session.join_room("demo").unwrap();
        session.set_device_capabilities(caps.clone(), &caps).unwrap();
        session
    }

    fn video_params() -> RtpParameters {
        RtpParameters {
            codecs: vec![RtpCodecParameters {
                mime_type: "video/VP8".to_string(),
                payload_type: 96,
                clock_rate: 90_000,
            }],
            mid: None,
        }
    }

    #[tokio::test]
    async fn test_create_requires_in_room() {
        let (_engine, negotiator) = rig().await;
        let mut session = PeerSession::new(PeerId::new());

        let result = negotiator
            .create(&mut session, TransportDirection::Send)
            .await;
        assert!(matches!(result, Err(SignalError::PeerNotReady(_))));
        assert_eq!(session.transport_count(), 0);
    }

    #[tokio::test]
    async fn test_connect_is_idempotent_without_second_engine_call() {
        let (engine, negotiator) = rig().await;
        let mut session = ready_session();

        let descriptor = negotiator
            .create(&mut session, TransportDirection::Send)
            .await
            .unwrap();

        let first = negotiator
            .connect(&mut session, descriptor.id, descriptor.dtls_parameters.clone())
            .await
            .unwrap();
        assert_eq!(first, ConnectOutcome::Connected);

        let second = negotiator
            .connect(&mut session, descriptor.id, descriptor.dtls_parameters.clone())
            .await
            .unwrap();
        assert_eq!(second, ConnectOutcome::AlreadyConnected);

        assert_eq!(engine.connect_call_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_unknown_transport() {
        let (_engine, negotiator) = rig().await;
        let mut session = ready_session();

        let result = negotiator
            .connect(
                &mut session,
                TransportId::new(),
                DtlsParameters {
                    role: media_engine::DtlsRole::Client,
                    fingerprints: vec![],
                },
            )
            .await;
        assert!(matches!(result, Err(SignalError::TransportNotFound(_))));
    }

    #[tokio::test]
    async fn test_engine_rejection_closes_transport() {
        let (engine, negotiator) = rig().await;
        let mut session = ready_session();

        let descriptor = negotiator
            .create(&mut session, TransportDirection::Send)
            .await
            .unwrap();

        // Empty fingerprint list is rejected by the engine
        let result = negotiator
            .connect(
                &mut session,
                descriptor.id,
                DtlsParameters {
                    role: media_engine::DtlsRole::Client,
                    fingerprints: vec![],
                },
            )
            .await;
        assert!(matches!(result, Err(SignalError::TransportConnectFailed(_))));
        assert!(session.transport(descriptor.id).unwrap().is_closed());
        assert_eq!(engine.open_transport_count().await, 0);

        // Retrying against the closed transport is NOT_FOUND territory now
        let retry = negotiator
            .connect(&mut session, descriptor.id, descriptor.dtls_parameters.clone())
            .await;
        assert!(matches!(retry, Err(SignalError::TransportClosed(_))));
    }

    /// Engine double whose connect never completes.
    struct StallingEngine {
        inner: LocalMediaEngine,
    }

    #[async_trait]
    impl MediaEngineAdapter for StallingEngine {
        async fn create_router(
            &self,
            media_codecs: Vec<RtpCodecCapability>,
        ) -> Result<(RouterId, RtpCapabilities), MediaEngineError> {
            self.inner.create_router(media_codecs).await
        }

        async fn create_transport(
            &self,
            router_id: RouterId,
        ) -> Result<TransportDescriptor, MediaEngineError> {
            self.inner.create_transport(router_id).await
        }

        async fn connect_transport(
            &self,
            _transport_id: TransportId,
            _dtls_parameters: DtlsParameters,
        ) -> Result<(), MediaEngineError> {
            std::future::pending().await
        }

        async fn create_producer(
            &self,
            transport_id: TransportId,
            kind: MediaKind,
            rtp_parameters: RtpParameters,
        ) -> Result<ProducerId, MediaEngineError> {
            self.inner
                .create_producer(transport_id, kind, rtp_parameters)
                .await
        }

        async fn create_consumer(
            &self,
            transport_id: TransportId,
            producer_id: ProducerId,
            rtp_capabilities: RtpCapabilities,
        ) -> Result<ConsumerDescriptor, MediaEngineError> {
            self.inner
                .create_consumer(transport_id, producer_id, rtp_capabilities)
                .await
        }

        async fn close_transport(
            &self,
            transport_id: TransportId,
        ) -> Result<(), MediaEngineError> {
            self.inner.close_transport(transport_id).await
        }

        async fn close_producer(&self, producer_id: ProducerId) -> Result<(), MediaEngineError> {
            self.inner.close_producer(producer_id).await
        }

        async fn close_consumer(&self, consumer_id: ConsumerId) -> Result<(), MediaEngineError> {
            self.inner.close_consumer(consumer_id).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_timeout_fails_the_peer() {
        let engine: Arc<dyn MediaEngineAdapter> = Arc::new(StallingEngine {
            inner: LocalMediaEngine::new(),
        });
        let routers = Arc::new(RouterRegistry::new(Arc::clone(&engine)));
        routers.initialize(default_media_codecs()).await.unwrap();
        let negotiator =
            TransportNegotiator::new(Arc::clone(&engine), routers, Duration::from_secs(10));

        let mut session = ready_session();
        let descriptor = negotiator
            .create(&mut session, TransportDirection::Send)
            .await
            .unwrap();

        // Paused clock auto-advances past the 10s timeout
        let result = negotiator
            .connect(&mut session, descriptor.id, descriptor.dtls_parameters.clone())
            .await;
        assert!(matches!(result, Err(SignalError::Disconnected)));
        assert!(session.transport(descriptor.id).unwrap().is_closed());
    }

    #[tokio::test]
    async fn test_produce_requires_connected_transport() {
        let (_engine, negotiator) = rig().await;
        let mut session = ready_session();

        let descriptor = negotiator
            .create(&mut session, TransportDirection::Send)
            .await
            .unwrap();

        let early = negotiator
            .produce(
                &mut session,
                descriptor.id,
                MediaKind::Video,
                video_params(),
            )
            .await;
        assert!(matches!(early, Err(SignalError::PeerNotReady(_))));

        let unknown = negotiator
            .produce(
                &mut session,
                TransportId::new(),
                MediaKind::Video,
                video_params(),
            )
            .await;
        assert!(matches!(unknown, Err(SignalError::TransportNotFound(_))));
    }

    #[tokio::test]
    async fn test_teardown_releases_everything() {
        let (engine, negotiator) = rig().await;
        let mut session = ready_session();

        let send = negotiator
            .create(&mut session, TransportDirection::Send)
            .await
            .unwrap();
        negotiator
            .connect(&mut session, send.id, send.dtls_parameters.clone())
            .await
            .unwrap();
        negotiator
            .produce(&mut session, send.id, MediaKind::Video, video_params())
            .await
            .unwrap();

        let recv = negotiator
            .create(&mut session, TransportDirection::Recv)
            .await
            .unwrap();
        negotiator
            .connect(&mut session, recv.id, recv.dtls_parameters.clone())
            .await
            .unwrap();

        negotiator.teardown(&mut session, None).await;

        assert_eq!(session.transport_count(), 0);
        assert_eq!(session.producer_count(), 0);
        assert_eq!(engine.open_transport_count().await, 0);
        assert_eq!(engine.open_producer_count().await, 0);
    }
}
