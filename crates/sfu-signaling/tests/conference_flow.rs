//! End-to-end conference flows through the signaling core.
//!
//! Drives full peer lifecycles (join, device init, transports, produce,
//! consume, close, leave) against the in-process engine, both through the
//! protocol driver directly and over a real TCP socket.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::collections::HashMap;
use std::sync::Arc;

use media_engine::{
    LocalMediaEngine, MediaEngineAdapter, MediaKind, ProducerId, RtpCodecParameters, RtpParameters,
};
use sfu_signaling::actors::{RoomEvent, RoomRegistryActor, SignalMetrics};
use sfu_signaling::config::{default_media_codecs, Config};
use sfu_signaling::gateway::{GatewayContext, PeerConnection, SignalingGateway};
use sfu_signaling::protocol::{
    ClientRequest, Notification, RequestBody, ResponseBody, ServerMessage, TransportDirection,
    WireError,
};
use sfu_signaling::router::RouterRegistry;
use sfu_signaling::session::SessionPhase;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

struct Harness {
    ctx: GatewayContext,
    engine: Arc<LocalMediaEngine>,
    _registry_task: tokio::task::JoinHandle<()>,
}

async fn harness(max_peers_per_room: usize) -> Harness {
    let engine = Arc::new(LocalMediaEngine::new());
    let adapter: Arc<dyn MediaEngineAdapter> = Arc::clone(&engine) as Arc<dyn MediaEngineAdapter>;
    let routers = Arc::new(RouterRegistry::new(Arc::clone(&adapter)));
    routers.initialize(default_media_codecs()).await.unwrap();
    let metrics = SignalMetrics::new();
    let (registry, registry_task) = RoomRegistryActor::spawn(
        Arc::clone(&adapter),
        Arc::clone(&routers),
        Arc::clone(&metrics),
        max_peers_per_room,
    );
    let config = Arc::new(Config::from_vars(&HashMap::new()).unwrap());

    Harness {
        ctx: GatewayContext {
            config,
            adapter,
            routers,
            registry,
            metrics,
        },
        engine,
        _registry_task: registry_task,
    }
}

/// One simulated client: the protocol driver plus its room event channel,
/// driven the same way the connection task drives them.
struct TestPeer {
    conn: PeerConnection,
    events: mpsc::Receiver<RoomEvent>,
    next_id: u64,
    send_transport: Option<media_engine::TransportId>,
}

impl TestPeer {
    fn connect(ctx: &GatewayContext) -> Self {
        let (conn, events) = PeerConnection::new(ctx.clone());
        Self {
            conn,
            events,
            next_id: 0,
            send_transport: None,
        }
    }

    async fn request(&mut self, body: RequestBody) -> ServerMessage {
        self.next_id += 1;
        self.conn
            .handle_request(ClientRequest {
                id: self.next_id,
                body,
            })
            .await
    }

    async fn expect_ok(&mut self, body: RequestBody) -> ResponseBody {
        match self.request(body).await {
            ServerMessage::Response {
                result: Some(result),
                error: None,
                ..
            } => result,
            other => panic!("expected success, got {other:?}"),
        }
    }

    async fn expect_err(&mut self, body: RequestBody) -> WireError {
        match self.request(body).await {
            ServerMessage::Response {
                result: None,
                error: Some(error),
                ..
            } => error,
            other => panic!("expected error, got {other:?}"),
        }
    }

    /// Full onboarding: join, init device from the returned capabilities,
    /// create and connect one send and one recv transport.
    async fn ready(&mut self, room_id: &str) {
        let rtp_capabilities = match self
            .expect_ok(RequestBody::JoinRoom {
                room_id: room_id.to_string(),
            })
            .await
        {
            ResponseBody::Joined(joined) => joined.rtp_capabilities,
            other => panic!("expected joined, got {other:?}"),
        };
        self.expect_ok(RequestBody::InitDevice { rtp_capabilities })
            .await;
        self.send_transport = Some(self.open_transport(TransportDirection::Send).await);
        self.open_transport(TransportDirection::Recv).await;
    }

    async fn open_transport(
        &mut self,
        direction: TransportDirection,
    ) -> media_engine::TransportId {
        let descriptor = match self
            .expect_ok(RequestBody::CreateTransport { direction })
            .await
        {
            ResponseBody::TransportCreated(descriptor) => descriptor,
            other => panic!("expected transport, got {other:?}"),
        };
        self.expect_ok(RequestBody::ConnectTransport {
            transport_id: descriptor.id,
            dtls_parameters: descriptor.dtls_parameters.clone(),
        })
        .await;
        descriptor.id
    }

    async fn produce(&mut self, kind: MediaKind) -> ProducerId {
        let transport_id = self.send_transport.expect("no send transport");
        let response = self
            .expect_ok(RequestBody::Produce {
                transport_id,
                kind,
                rtp_parameters: params_for(kind),
            })
            .await;
        match response {
            ResponseBody::Produced(produced) => produced.producer_id,
            other => panic!("expected produced, got {other:?}"),
        }
    }

    /// Apply every queued room event, returning the notification frames the
    /// client would have received.
    fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut notifications = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let Some(ServerMessage::Notification { notification }) =
                self.conn.handle_room_event(event)
            {
                notifications.push(notification);
            }
        }
        notifications
    }
}

fn params_for(kind: MediaKind) -> RtpParameters {
    let codec = match kind {
        MediaKind::Audio => RtpCodecParameters {
            mime_type: "audio/opus".to_string(),
            payload_type: 111,
            clock_rate: 48_000,
        },
        MediaKind::Video => RtpCodecParameters {
            mime_type: "video/VP8".to_string(),
            payload_type: 96,
            clock_rate: 90_000,
        },
    };
    RtpParameters {
        codecs: vec![codec],
        mid: None,
    }
}

#[tokio::test]
async fn test_late_joiner_pulls_existing_producer() {
    let harness = harness(8).await;

    let mut alice = TestPeer::connect(&harness.ctx);
    alice.ready("demo").await;
    let producer_id = alice.produce(MediaKind::Audio).await;

    // Bob joins after the producer exists: no push, the snapshot has it
    let mut bob = TestPeer::connect(&harness.ctx);
    bob.ready("demo").await;
    assert!(bob.drain_notifications().is_empty());

    let producers = match bob.expect_ok(RequestBody::ListProducers).await {
        ResponseBody::Producers(list) => list.producers,
        other => panic!("expected producer list, got {other:?}"),
    };
    assert_eq!(producers.len(), 1);
    assert_eq!(producers[0].producer_id, producer_id);
    assert_eq!(producers[0].peer_id, alice.conn.peer_id());
    assert_eq!(producers[0].kind, MediaKind::Audio);
    assert!(!producers[0].paused);

    let descriptor = match bob.expect_ok(RequestBody::Consume { producer_id }).await {
        ResponseBody::Consumed(descriptor) => descriptor,
        other => panic!("expected consumer, got {other:?}"),
    };
    assert_eq!(descriptor.producer_id, producer_id);
    assert_eq!(descriptor.kind, MediaKind::Audio);
    assert_eq!(harness.engine.open_consumer_count().await, 1);

    // Consuming the same producer again yields the same consumer
    let repeat = match bob.expect_ok(RequestBody::Consume { producer_id }).await {
        ResponseBody::Consumed(descriptor) => descriptor,
        other => panic!("expected consumer, got {other:?}"),
    };
    assert_eq!(repeat.id, descriptor.id);
    assert_eq!(harness.engine.open_consumer_count().await, 1);
}

#[tokio::test]
async fn test_eager_pairing_for_ready_receiver() {
    let harness = harness(8).await;

    let mut bob = TestPeer::connect(&harness.ctx);
    bob.ready("demo").await;

    // Bob already holds a connected recv transport, so Alice's producer
    // arrives pre-paired
    let mut alice = TestPeer::connect(&harness.ctx);
    alice.ready("demo").await;
    let producer_id = alice.produce(MediaKind::Video).await;

    let notifications = bob.drain_notifications();
    assert_eq!(notifications.len(), 1);
    match &notifications[0] {
        Notification::NewProducer {
            producer_id: announced,
            peer_id,
            kind,
            consumer,
        } => {
            assert_eq!(*announced, producer_id);
            assert_eq!(*peer_id, alice.conn.peer_id());
            assert_eq!(*kind, MediaKind::Video);
            let consumer = consumer.as_ref().expect("eager pairing missing");
            assert_eq!(consumer.producer_id, producer_id);
        }
        other => panic!("expected newProducer, got {other:?}"),
    }
    assert_eq!(bob.conn.session().consumer_count(), 1);
    assert_eq!(harness.engine.open_consumer_count().await, 1);
}

#[tokio::test]
async fn test_repeat_connect_reaches_engine_once() {
    let harness = harness(8).await;

    let mut alice = TestPeer::connect(&harness.ctx);
    let rtp_capabilities = match alice
        .expect_ok(RequestBody::JoinRoom {
            room_id: "demo".to_string(),
        })
        .await
    {
        ResponseBody::Joined(joined) => joined.rtp_capabilities,
        other => panic!("expected joined, got {other:?}"),
    };
    alice
        .expect_ok(RequestBody::InitDevice { rtp_capabilities })
        .await;

    let descriptor = match alice
        .expect_ok(RequestBody::CreateTransport {
            direction: TransportDirection::Send,
        })
        .await
    {
        ResponseBody::TransportCreated(descriptor) => descriptor,
        other => panic!("expected transport, got {other:?}"),
    };

    for _ in 0..3 {
        alice
            .expect_ok(RequestBody::ConnectTransport {
                transport_id: descriptor.id,
                dtls_parameters: descriptor.dtls_parameters.clone(),
            })
            .await;
    }
    assert_eq!(harness.engine.connect_call_count(), 1);
}

#[tokio::test]
async fn test_producer_close_cascades_room_wide() {
    let harness = harness(8).await;

    let mut alice = TestPeer::connect(&harness.ctx);
    alice.ready("demo").await;
    let mut bob = TestPeer::connect(&harness.ctx);
    bob.ready("demo").await;

    let producer_id = alice.produce(MediaKind::Audio).await;
    let notifications = bob.drain_notifications();
    assert_eq!(notifications.len(), 1);
    let consumer_id = match &notifications[0] {
        Notification::NewProducer { consumer, .. } => consumer.as_ref().unwrap().id,
        other => panic!("expected newProducer, got {other:?}"),
    };

    alice
        .expect_ok(RequestBody::CloseProducer { producer_id })
        .await;

    // Bob's consumer was closed server-side before the response
    assert_eq!(harness.engine.open_producer_count().await, 0);
    assert_eq!(harness.engine.open_consumer_count().await, 0);

    let notifications = bob.drain_notifications();
    assert_eq!(notifications.len(), 1);
    match &notifications[0] {
        Notification::ProducerClosed {
            producer_id: closed,
            consumer_id: released,
        } => {
            assert_eq!(*closed, producer_id);
            assert_eq!(*released, Some(consumer_id));
        }
        other => panic!("expected producerClosed, got {other:?}"),
    }
    assert_eq!(bob.conn.session().consumer_count(), 0);

    // Closing an unknown producer reports NOT_FOUND
    let error = alice
        .expect_err(RequestBody::CloseProducer { producer_id })
        .await;
    assert_eq!(error.code, 2);
}

#[tokio::test]
async fn test_disconnect_cascade_releases_everything() {
    let harness = harness(8).await;

    let mut alice = TestPeer::connect(&harness.ctx);
    alice.ready("demo").await;
    let mut bob = TestPeer::connect(&harness.ctx);
    bob.ready("demo").await;

    let producer_id = alice.produce(MediaKind::Video).await;
    bob.drain_notifications();
    assert_eq!(bob.conn.session().consumer_count(), 1);

    let room = bob.conn.room().unwrap().clone();
    assert_eq!(room.member_count().await.unwrap(), 2);

    // Alice's socket dies: the disconnect cascade runs
    alice.conn.teardown().await;
    assert_eq!(alice.conn.session().phase(), SessionPhase::Disconnected);

    assert_eq!(harness.engine.open_producer_count().await, 0);
    assert_eq!(harness.engine.open_consumer_count().await, 0);
    assert_eq!(room.member_count().await.unwrap(), 1);

    let notifications = bob.drain_notifications();
    assert_eq!(notifications.len(), 1);
    assert!(matches!(
        &notifications[0],
        Notification::ProducerClosed { producer_id: closed, .. } if *closed == producer_id
    ));
    assert_eq!(bob.conn.session().consumer_count(), 0);

    // Teardown is idempotent
    alice.conn.teardown().await;
    assert_eq!(room.member_count().await.unwrap(), 1);
}

#[tokio::test]
async fn test_leave_room_allows_rejoin() {
    let harness = harness(8).await;

    let mut alice = TestPeer::connect(&harness.ctx);
    alice.ready("demo").await;
    alice.produce(MediaKind::Audio).await;

    alice.expect_ok(RequestBody::LeaveRoom).await;
    assert_eq!(alice.conn.session().phase(), SessionPhase::DeviceReady);
    assert_eq!(harness.engine.open_transport_count().await, 0);
    assert_eq!(harness.engine.open_producer_count().await, 0);

    // Leaving again is a harmless no-op
    alice.expect_ok(RequestBody::LeaveRoom).await;

    // The session may join again and negotiate fresh transports
    alice.send_transport = None;
    alice.ready("other").await;
    assert_eq!(alice.conn.session().phase(), SessionPhase::InRoom);
    alice.produce(MediaKind::Video).await;
}

#[tokio::test]
async fn test_second_room_join_conflicts() {
    let harness = harness(8).await;

    let mut alice = TestPeer::connect(&harness.ctx);
    alice.ready("alpha").await;

    // Re-joining the same room is idempotent
    let response = alice
        .expect_ok(RequestBody::JoinRoom {
            room_id: "alpha".to_string(),
        })
        .await;
    assert!(matches!(response, ResponseBody::Joined(_)));

    let error = alice
        .expect_err(RequestBody::JoinRoom {
            room_id: "beta".to_string(),
        })
        .await;
    assert_eq!(error.code, 5);
    assert_eq!(alice.conn.session().room_id(), Some("alpha"));
}

#[tokio::test]
async fn test_room_capacity_is_enforced() {
    let harness = harness(1).await;

    let mut alice = TestPeer::connect(&harness.ctx);
    alice.ready("tiny").await;

    let mut bob = TestPeer::connect(&harness.ctx);
    let error = bob
        .expect_err(RequestBody::JoinRoom {
            room_id: "tiny".to_string(),
        })
        .await;
    assert_eq!(error.code, 7);
    // The rejected session holds no membership and may join elsewhere
    assert_eq!(bob.conn.session().room_id(), None);
    bob.ready("spare").await;
}

#[tokio::test]
async fn test_pause_state_is_visible_to_late_joiners() {
    let harness = harness(8).await;

    let mut alice = TestPeer::connect(&harness.ctx);
    alice.ready("demo").await;
    let producer_id = alice.produce(MediaKind::Audio).await;
    alice
        .expect_ok(RequestBody::PauseProducer { producer_id })
        .await;

    let mut bob = TestPeer::connect(&harness.ctx);
    bob.ready("demo").await;
    let producers = match bob.expect_ok(RequestBody::ListProducers).await {
        ResponseBody::Producers(list) => list.producers,
        other => panic!("expected producer list, got {other:?}"),
    };
    assert_eq!(producers.len(), 1);
    assert!(producers[0].paused);

    alice
        .expect_ok(RequestBody::ResumeProducer { producer_id })
        .await;
    let producers = match bob.expect_ok(RequestBody::ListProducers).await {
        ResponseBody::Producers(list) => list.producers,
        other => panic!("expected producer list, got {other:?}"),
    };
    assert!(!producers[0].paused);
}

#[tokio::test]
async fn test_operations_require_readiness() {
    let harness = harness(8).await;
    let mut alice = TestPeer::connect(&harness.ctx);

    // No room, no device: transport creation is premature
    let error = alice
        .expect_err(RequestBody::CreateTransport {
            direction: TransportDirection::Send,
        })
        .await;
    assert_eq!(error.code, 1);

    // Consume without a room is premature too
    let error = alice
        .expect_err(RequestBody::Consume {
            producer_id: ProducerId::new(),
        })
        .await;
    assert_eq!(error.code, 1);
}

#[tokio::test]
async fn test_concurrent_joins_linearize() {
    let harness = harness(32).await;

    let mut anchor = TestPeer::connect(&harness.ctx);
    anchor.ready("busy").await;
    let room = anchor.conn.room().unwrap().clone();

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let ctx = harness.ctx.clone();
        tasks.push(tokio::spawn(async move {
            let mut peer = TestPeer::connect(&ctx);
            peer.ready("busy").await;
            peer
        }));
    }
    let mut peers = Vec::new();
    for task in tasks {
        peers.push(task.await.unwrap());
    }
    assert_eq!(room.member_count().await.unwrap(), 9);

    // Half of them leave concurrently; the count stays exact
    let mut leavers = Vec::new();
    for mut peer in peers.drain(..4) {
        leavers.push(tokio::spawn(async move {
            peer.expect_ok(RequestBody::LeaveRoom).await;
            peer
        }));
    }
    for task in leavers {
        task.await.unwrap();
    }
    assert_eq!(room.member_count().await.unwrap(), 5);
}

#[tokio::test]
async fn test_gateway_over_tcp() {
    let harness = harness(8).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    tokio::spawn(SignalingGateway::new(harness.ctx.clone()).run(listener, shutdown.clone()));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (read_half, mut write_half) = stream.into_split();
    let mut lines = BufReader::new(read_half).lines();

    let send = |body: RequestBody, id: u64| {
        let mut frame = serde_json::to_string(&ClientRequest { id, body }).unwrap();
        frame.push('\n');
        frame
    };

    // joinRoom
    let frame = send(
        RequestBody::JoinRoom {
            room_id: "tcp".to_string(),
        },
        1,
    );
    write_half.write_all(frame.as_bytes()).await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let message: ServerMessage = serde_json::from_str(&line).unwrap();
    let rtp_capabilities = match message {
        ServerMessage::Response {
            id: 1,
            result: Some(ResponseBody::Joined(joined)),
            error: None,
        } => joined.rtp_capabilities,
        other => panic!("expected joined, got {other:?}"),
    };

    // initDevice with the returned capabilities
    let frame = send(RequestBody::InitDevice { rtp_capabilities }, 2);
    write_half.write_all(frame.as_bytes()).await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let message: ServerMessage = serde_json::from_str(&line).unwrap();
    assert!(matches!(
        message,
        ServerMessage::Response {
            id: 2,
            result: Some(ResponseBody::Ack(_)),
            error: None,
        }
    ));

    // A malformed frame gets an error response and the connection survives
    write_half
        .write_all(b"{\"id\":9,\"method\":\"noSuchThing\"}\n")
        .await
        .unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let message: ServerMessage = serde_json::from_str(&line).unwrap();
    match message {
        ServerMessage::Response {
            id: 9,
            result: None,
            error: Some(error),
        } => assert_eq!(error.code, 8),
        other => panic!("expected error response, got {other:?}"),
    }

    let frame = send(RequestBody::ListProducers, 3);
    write_half.write_all(frame.as_bytes()).await.unwrap();
    let line = lines.next_line().await.unwrap().unwrap();
    let message: ServerMessage = serde_json::from_str(&line).unwrap();
    assert!(matches!(
        message,
        ServerMessage::Response {
            id: 3,
            result: Some(ResponseBody::Producers(_)),
            error: None,
        }
    ));

    shutdown.cancel();
}
