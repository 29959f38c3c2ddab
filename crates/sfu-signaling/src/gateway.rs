//! `SignalingGateway` - TCP listener and per-connection protocol driver.
//!
//! One task per client connection, newline-delimited JSON frames. Requests
//! for one peer are processed strictly in arrival order; room pushes are
//! interleaved between requests. A malformed frame gets an error response
//! without killing the connection.
//!
//! Every failure path of a connection (read error/EOF, the device-ready
//! deadline, a transport-connect timeout, gateway shutdown) funnels into
//! one teardown: the `Leaving` cascade over every owned transport, then
//! leaving the room.

use std::net::SocketAddr;
use std::sync::Arc;

use media_engine::MediaEngineAdapter;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::actors::{RoomActorHandle, RoomEvent, RoomRegistryHandle, SignalMetrics};
use crate::config::Config;
use crate::errors::SignalError;
use crate::negotiator::{ConnectOutcome, TransportNegotiator};
use crate::protocol::{
    AckResponse, ClientRequest, JoinedResponse, Notification, ProducedResponse,
    ProducerListResponse, RequestBody, ResponseBody, ServerMessage, TransportDirection,
};
use crate::router::RouterRegistry;
use crate::session::{ConsumerRecord, PeerSession, SessionPhase};

/// Buffer for room-to-peer event channels.
const EVENT_CHANNEL_BUFFER: usize = 64;

/// Buffer for the per-connection outbound writer.
const OUTBOUND_CHANNEL_BUFFER: usize = 64;

/// Shared dependencies of every connection.
#[derive(Clone)]
pub struct GatewayContext {
    pub config: Arc<Config>,
    pub adapter: Arc<dyn MediaEngineAdapter>,
    pub routers: Arc<RouterRegistry>,
    pub registry: RoomRegistryHandle,
    pub metrics: Arc<SignalMetrics>,
}

/// The TCP accept loop.
pub struct SignalingGateway {
    ctx: GatewayContext,
}

impl SignalingGateway {
    #[must_use]
    pub fn new(ctx: GatewayContext) -> Self {
        Self { ctx }
    }

    /// Run the accept loop until cancelled. The listener is bound by the
    /// caller so bind errors fail startup.
    pub async fn run(self, listener: TcpListener, cancel_token: CancellationToken) {
        info!(target: "signal.gateway", "Signaling gateway accepting connections");

        loop {
            tokio::select! {
                () = cancel_token.cancelled() => {
                    info!(target: "signal.gateway", "Signaling gateway shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let ctx = self.ctx.clone();
                            let connection_token = cancel_token.child_token();
                            tokio::spawn(async move {
                                run_connection(ctx, stream, addr, connection_token).await;
                            });
                        }
                        Err(e) => {
                            warn!(target: "signal.gateway", error = %e, "Accept failed");
                            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
    }
}

/// Drive one client connection to completion.
#[instrument(skip_all, name = "signal.gateway.connection", fields(addr = %addr))]
async fn run_connection(
    ctx: GatewayContext,
    stream: TcpStream,
    addr: SocketAddr,
    cancel_token: CancellationToken,
) {
    let device_ready_timeout = ctx.config.device_ready_timeout();
    let (mut peer, mut events) = PeerConnection::new(ctx);
    let peer_id = peer.peer_id();
    info!(
        target: "signal.gateway",
        peer_id = %peer_id,
        addr = %addr,
        "Connection accepted"
    );

    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    // Dedicated writer so a slow client never blocks request handling.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(OUTBOUND_CHANNEL_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            match serde_json::to_string(&message) {
                Ok(mut line) => {
                    line.push('\n');
                    if write_half.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!(target: "signal.gateway", error = %e, "Frame serialization failed");
                }
            }
        }
    });

    let device_deadline = tokio::time::sleep(device_ready_timeout);
    tokio::pin!(device_deadline);

    loop {
        tokio::select! {
            () = cancel_token.cancelled() => {
                debug!(target: "signal.gateway", peer_id = %peer_id, "Connection cancelled");
                break;
            }
            () = &mut device_deadline, if !peer.is_device_ready() => {
                warn!(
                    target: "signal.gateway",
                    peer_id = %peer_id,
                    timeout_secs = device_ready_timeout.as_secs(),
                    "Device-ready deadline expired, failing connection"
                );
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => {
                        if let Some(message) = peer.handle_room_event(event) {
                            if out_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                    }
                    None => break,
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if line.trim().is_empty() {
                            continue;
                        }
                        let message = match serde_json::from_str::<ClientRequest>(&line) {
                            Ok(request) => peer.handle_request(request).await,
                            Err(e) => {
                                debug!(
                                    target: "signal.gateway",
                                    peer_id = %peer_id,
                                    error = %e,
                                    "Malformed frame"
                                );
                                ServerMessage::error(
                                    salvage_request_id(&line),
                                    &SignalError::InvalidRequest(format!(
                                        "malformed request: {e}"
                                    )),
                                )
                            }
                        };
                        if out_tx.send(message).await.is_err() {
                            break;
                        }
                        if peer.is_failed() {
                            break;
                        }
                    }
                    Ok(None) => {
                        debug!(target: "signal.gateway", peer_id = %peer_id, "Connection EOF");
                        break;
                    }
                    Err(e) => {
                        debug!(
                            target: "signal.gateway",
                            peer_id = %peer_id,
                            error = %e,
                            "Connection read error"
                        );
                        break;
                    }
                }
            }
        }
    }

    peer.teardown().await;
    drop(out_tx);
    let _ = writer.await;
    info!(target: "signal.gateway", peer_id = %peer_id, "Connection closed");
}

/// Pull a correlation id out of a frame that failed to parse, so the error
/// response can still be matched client-side.
fn salvage_request_id(line: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(line)
        .ok()
        .and_then(|value| value.get("id").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}

/// Per-connection protocol driver: owns the peer session and applies
/// requests and room events in arrival order.
pub struct PeerConnection {
    ctx: GatewayContext,
    negotiator: TransportNegotiator,
    session: PeerSession,
    room: Option<RoomActorHandle>,
    events_tx: mpsc::Sender<RoomEvent>,
    /// The connected recv transport announced to the room, if any.
    recv_context: Option<media_engine::TransportId>,
    failed: bool,
}

impl PeerConnection {
    /// Build a driver plus the receiver of its room event channel (the
    /// caller's select loop drains it).
    #[must_use]
    pub fn new(ctx: GatewayContext) -> (Self, mpsc::Receiver<RoomEvent>) {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let negotiator = TransportNegotiator::new(
            Arc::clone(&ctx.adapter),
            Arc::clone(&ctx.routers),
            ctx.config.transport_connect_timeout(),
        );
        let connection = Self {
            ctx,
            negotiator,
            session: PeerSession::new(crate::protocol::PeerId::new()),
            room: None,
            events_tx,
            recv_context: None,
            failed: false,
        };
        (connection, events_rx)
    }

    #[must_use]
    pub fn peer_id(&self) -> crate::protocol::PeerId {
        self.session.peer_id()
    }

    #[must_use]
    pub fn session(&self) -> &PeerSession {
        &self.session
    }

    #[must_use]
    pub fn room(&self) -> Option<&RoomActorHandle> {
        self.room.as_ref()
    }

    #[must_use]
    pub fn is_device_ready(&self) -> bool {
        self.session.device_capabilities().is_some()
    }

    /// Whether a fatal error has failed this peer (the connection must be
    /// torn down).
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// Apply one request and produce its response frame.
    pub async fn handle_request(&mut self, request: ClientRequest) -> ServerMessage {
        let id = request.id;
        let method = request.body.method();
        match self.dispatch(request.body).await {
            Ok(result) => ServerMessage::ok(id, result),
            Err(e) => {
                warn!(
                    target: "signal.gateway",
                    peer_id = %self.session.peer_id(),
                    method,
                    error = %e,
                    code = e.error_code(),
                    "Request failed"
                );
                if matches!(e, SignalError::Disconnected) {
                    self.failed = true;
                }
                ServerMessage::error(id, &e)
            }
        }
    }

    async fn dispatch(&mut self, body: RequestBody) -> Result<ResponseBody, SignalError> {
        match body {
            RequestBody::JoinRoom { room_id } => self.join_room(room_id).await,
            RequestBody::InitDevice { rtp_capabilities } => {
                let router_capabilities = self.ctx.routers.capabilities().await?;
                self.session
                    .set_device_capabilities(rtp_capabilities, &router_capabilities)?;
                Ok(ResponseBody::Ack(AckResponse::default()))
            }
            RequestBody::CreateTransport { direction } => {
                let descriptor = self.negotiator.create(&mut self.session, direction).await?;
                Ok(ResponseBody::TransportCreated(descriptor))
            }
            RequestBody::ConnectTransport {
                transport_id,
                dtls_parameters,
            } => {
                let direction = self
                    .session
                    .transport(transport_id)
                    .map(crate::transport::TransportRecord::direction);
                let outcome = self
                    .negotiator
                    .connect(&mut self.session, transport_id, dtls_parameters)
                    .await?;

                // A freshly connected recv transport makes the peer eligible
                // for eager pairing.
                if outcome == ConnectOutcome::Connected
                    && direction == Some(TransportDirection::Recv)
                {
                    self.announce_consume_context(transport_id).await;
                }
                Ok(ResponseBody::Ack(AckResponse::default()))
            }
            RequestBody::Produce {
                transport_id,
                kind,
                rtp_parameters,
            } => {
                let room = self.require_room()?.clone();
                let producer_id = self
                    .negotiator
                    .produce(&mut self.session, transport_id, kind, rtp_parameters)
                    .await?;

                if let Err(e) = room
                    .register_producer(self.session.peer_id(), producer_id, kind)
                    .await
                {
                    // Registration failed; do not leave an unindexed
                    // producer behind.
                    let _ = self
                        .negotiator
                        .close_producer(&mut self.session, None, producer_id)
                        .await;
                    return Err(e);
                }
                Ok(ResponseBody::Produced(ProducedResponse { producer_id }))
            }
            RequestBody::PauseProducer { producer_id } => {
                self.set_producer_paused(producer_id, true).await?;
                Ok(ResponseBody::Ack(AckResponse::default()))
            }
            RequestBody::ResumeProducer { producer_id } => {
                self.set_producer_paused(producer_id, false).await?;
                Ok(ResponseBody::Ack(AckResponse::default()))
            }
            RequestBody::CloseProducer { producer_id } => {
                let room = self.room.clone();
                self.negotiator
                    .close_producer(&mut self.session, room.as_ref(), producer_id)
                    .await?;
                Ok(ResponseBody::Ack(AckResponse::default()))
            }
            RequestBody::CloseTransport { transport_id } => {
                let room = self.room.clone();
                self.negotiator
                    .close_transport(&mut self.session, room.as_ref(), transport_id)
                    .await?;
                if self.recv_context == Some(transport_id) {
                    if let Some(room) = &self.room {
                        let _ = room
                            .clear_consume_context(self.session.peer_id(), transport_id)
                            .await;
                    }
                    self.recv_context = None;
                }
                Ok(ResponseBody::Ack(AckResponse::default()))
            }
            RequestBody::Consume { producer_id } => {
                let room = self.require_room()?.clone();
                let grant = room.consume(self.session.peer_id(), producer_id).await?;
                self.session.add_consumer(ConsumerRecord {
                    id: grant.descriptor.id,
                    producer_id,
                    transport_id: grant.transport_id,
                });
                Ok(ResponseBody::Consumed(grant.descriptor))
            }
            RequestBody::ListProducers => {
                let room = self.require_room()?.clone();
                let producers = room.list_producers().await?;
                Ok(ResponseBody::Producers(ProducerListResponse { producers }))
            }
            RequestBody::LeaveRoom => {
                self.leave_room().await;
                Ok(ResponseBody::Ack(AckResponse::default()))
            }
        }
    }

    async fn join_room(&mut self, room_id: String) -> Result<ResponseBody, SignalError> {
        if let Some(current) = self.session.room_id() {
            if current == room_id {
                // Idempotent re-join: capabilities again, no membership
                // change.
                let rtp_capabilities = self.ctx.routers.capabilities().await?;
                return Ok(ResponseBody::Joined(JoinedResponse { rtp_capabilities }));
            }
            return Err(SignalError::AlreadyInRoom(current.to_string()));
        }

        // Validate session state before touching the registry
        self.session.join_room(&room_id)?;
        match self
            .ctx
            .registry
            .join_room(
                room_id.clone(),
                self.session.peer_id(),
                self.events_tx.clone(),
            )
            .await
        {
            Ok(outcome) => {
                self.room = Some(outcome.room);
                Ok(ResponseBody::Joined(JoinedResponse {
                    rtp_capabilities: outcome.rtp_capabilities,
                }))
            }
            Err(e) => {
                self.session.leave_room();
                Err(e)
            }
        }
    }

    async fn set_producer_paused(
        &mut self,
        producer_id: media_engine::ProducerId,
        paused: bool,
    ) -> Result<(), SignalError> {
        self.session.producer_mut(producer_id)?.paused = paused;
        if let Some(room) = &self.room {
            room.set_producer_paused(producer_id, paused).await?;
        }
        Ok(())
    }

    async fn announce_consume_context(&mut self, transport_id: media_engine::TransportId) {
        let (Some(room), Some(capabilities)) = (&self.room, self.session.device_capabilities())
        else {
            return;
        };
        if let Err(e) = room
            .set_consume_context(self.session.peer_id(), transport_id, capabilities.clone())
            .await
        {
            warn!(
                target: "signal.gateway",
                peer_id = %self.session.peer_id(),
                transport_id = %transport_id,
                error = %e,
                "Consume context announcement failed"
            );
            return;
        }
        self.recv_context = Some(transport_id);
    }

    /// Apply one room event, returning the notification frame to forward
    /// (if any). Duplicates are harmless.
    pub fn handle_room_event(&mut self, event: RoomEvent) -> Option<ServerMessage> {
        match event {
            RoomEvent::ProducerAvailable {
                producer_id,
                peer_id,
                kind,
                grant,
            } => {
                let consumer = grant.map(|grant| {
                    self.session.add_consumer(ConsumerRecord {
                        id: grant.descriptor.id,
                        producer_id,
                        transport_id: grant.transport_id,
                    });
                    grant.descriptor
                });
                Some(ServerMessage::notification(Notification::NewProducer {
                    producer_id,
                    peer_id,
                    kind,
                    consumer,
                }))
            }
            RoomEvent::ProducerClosed {
                producer_id,
                consumer_id,
            } => {
                if let Some(consumer_id) = consumer_id {
                    self.session.remove_consumer(consumer_id);
                }
                Some(ServerMessage::notification(Notification::ProducerClosed {
                    producer_id,
                    consumer_id,
                }))
            }
        }
    }

    /// Explicit `leaveRoom`: full cascade, then membership drop. The
    /// session falls back to `DeviceReady`/`Connected`.
    pub async fn leave_room(&mut self) {
        let Some(room) = self.room.take() else {
            // No-op when not in a room
            return;
        };

        self.session.begin_leaving();
        self.negotiator.teardown(&mut self.session, Some(&room)).await;
        if let Err(e) = room.leave(self.session.peer_id()).await {
            warn!(
                target: "signal.gateway",
                peer_id = %self.session.peer_id(),
                room_id = %room.room_id(),
                error = %e,
                "Room leave failed"
            );
        }
        self.session.leave_room();
        self.recv_context = None;
    }

    /// Disconnect path: the `leaveRoom` cascade plus terminal session
    /// state. Idempotent.
    pub async fn teardown(&mut self) {
        if self.session.phase() == SessionPhase::Disconnected {
            return;
        }
        self.session.begin_leaving();
        let room = self.room.take();
        self.negotiator
            .teardown(&mut self.session, room.as_ref())
            .await;
        if let Some(room) = room {
            let _ = room.leave(self.session.peer_id()).await;
        }
        self.session.leave_room();
        self.session.mark_disconnected();
        self.recv_context = None;
    }

    fn require_room(&self) -> Result<&RoomActorHandle, SignalError> {
        self.room
            .as_ref()
            .ok_or_else(|| SignalError::PeerNotReady("join a room first".to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_salvage_request_id() {
        assert_eq!(salvage_request_id(r#"{"id":7,"method":"nope"}"#), 7);
        assert_eq!(salvage_request_id(r#"{"method":"nope"}"#), 0);
        assert_eq!(salvage_request_id("not json at all"), 0);
    }
}
