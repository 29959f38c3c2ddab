//! `RoomActor` - per-room actor that owns room state.
//!
//! Each `RoomActor`:
//! - Owns the member set and the producer index for one room
//! - Serializes every mutation through its mailbox (room-scoped mutual
//!   exclusion; different rooms proceed independently)
//! - Runs the producer/consumer matcher: eager pairing for members with a
//!   ready receive context, pull pairing (`consume`) for late joiners
//! - Cancels itself when the last member leaves; the registry reaps the
//!   finished task
//!
//! Pushes to members travel over their event channels and are
//! at-least-once; duplicates are harmless by design.

use std::collections::HashMap;
use std::sync::Arc;

use media_engine::{
    ConsumerId, MediaEngineAdapter, MediaEngineError, MediaKind, ProducerId, RtpCapabilities,
    TransportId,
};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::messages::{ConsumerGrant, RoomEvent, RoomMessage};
use super::metrics::SignalMetrics;
use crate::errors::SignalError;
use crate::protocol::{PeerId, ProducerSnapshot};

/// Channel buffer size for the room mailbox.
const ROOM_CHANNEL_BUFFER: usize = 256;

/// Handle to a `RoomActor`.
#[derive(Clone)]
pub struct RoomActorHandle {
    sender: mpsc::Sender<RoomMessage>,
    cancel_token: CancellationToken,
    room_id: String,
}

impl RoomActorHandle {
    /// Get the room ID.
    #[must_use]
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Join the room. Idempotent for an existing member.
    pub async fn join(
        &self,
        peer_id: PeerId,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Join {
                peer_id,
                events,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalError::Internal(format!("response receive failed: {e}")))?
    }

    /// Leave the room. Returns whether the room is now empty.
    pub async fn leave(&self, peer_id: PeerId) -> Result<bool, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Leave {
                peer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalError::Internal(format!("response receive failed: {e}")))
    }

    /// Announce the peer's ready receive side (connected recv transport +
    /// device capabilities).
    pub async fn set_consume_context(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
        rtp_capabilities: RtpCapabilities,
    ) -> Result<(), SignalError> {
        self.sender
            .send(RoomMessage::SetConsumeContext {
                peer_id,
                transport_id,
                rtp_capabilities,
            })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))
    }

    /// Withdraw the peer's receive context (recv transport closed).
    pub async fn clear_consume_context(
        &self,
        peer_id: PeerId,
        transport_id: TransportId,
    ) -> Result<(), SignalError> {
        self.sender
            .send(RoomMessage::ClearConsumeContext {
                peer_id,
                transport_id,
            })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))
    }

    /// Add a producer to the room index; matcher fan-out happens before the
    /// response.
    pub async fn register_producer(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
    ) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::RegisterProducer {
                peer_id,
                producer_id,
                kind,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalError::Internal(format!("response receive failed: {e}")))?
    }

    /// Remove a producer; every referencing consumer room-wide is closed
    /// before the response.
    pub async fn unregister_producer(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> Result<(), SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::UnregisterProducer {
                peer_id,
                producer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalError::Internal(format!("response receive failed: {e}")))?
    }

    /// Toggle the pause flag in the producer index.
    pub async fn set_producer_paused(
        &self,
        producer_id: ProducerId,
        paused: bool,
    ) -> Result<(), SignalError> {
        self.sender
            .send(RoomMessage::SetProducerPaused {
                producer_id,
                paused,
            })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))
    }

    /// Pull-pair a consumer for a named producer.
    pub async fn consume(
        &self,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> Result<ConsumerGrant, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::Consume {
                peer_id,
                producer_id,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalError::Internal(format!("response receive failed: {e}")))?
    }

    /// Release a consumer binding (peer-side cascade closed it).
    pub async fn release_consumer(
        &self,
        peer_id: PeerId,
        consumer_id: ConsumerId,
    ) -> Result<(), SignalError> {
        self.sender
            .send(RoomMessage::ReleaseConsumer {
                peer_id,
                consumer_id,
            })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))
    }

    /// Point-in-time snapshot of the producer index.
    pub async fn list_producers(&self) -> Result<Vec<ProducerSnapshot>, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::ListProducers { respond_to: tx })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalError::Internal(format!("response receive failed: {e}")))
    }

    /// Current member count.
    pub async fn member_count(&self) -> Result<usize, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RoomMessage::MemberCount { respond_to: tx })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalError::Internal(format!("response receive failed: {e}")))
    }

    /// Cancel the room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the actor is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// The peer's ready receive side.
struct ConsumeContext {
    transport_id: TransportId,
    rtp_capabilities: RtpCapabilities,
}

/// One room member.
struct Member {
    events: mpsc::Sender<RoomEvent>,
    consume: Option<ConsumeContext>,
}

/// Producer index entry.
struct ProducerEntry {
    peer_id: PeerId,
    kind: MediaKind,
    paused: bool,
}

/// One engine-paired consumer tracked against its source producer.
struct ConsumerBinding {
    peer_id: PeerId,
    grant: ConsumerGrant,
}

/// The `RoomActor` implementation.
pub struct RoomActor {
    room_id: String,
    receiver: mpsc::Receiver<RoomMessage>,
    cancel_token: CancellationToken,
    adapter: Arc<dyn MediaEngineAdapter>,
    members: HashMap<PeerId, Member>,
    producers: HashMap<ProducerId, ProducerEntry>,
    /// Consumers by source producer; a consumer never outlives its producer.
    bindings: HashMap<ProducerId, Vec<ConsumerBinding>>,
    max_peers: usize,
    metrics: Arc<SignalMetrics>,
}

impl RoomActor {
    /// Spawn a new room actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        room_id: String,
        cancel_token: CancellationToken,
        adapter: Arc<dyn MediaEngineAdapter>,
        metrics: Arc<SignalMetrics>,
        max_peers: usize,
    ) -> (RoomActorHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(ROOM_CHANNEL_BUFFER);

        let actor = Self {
            room_id: room_id.clone(),
            receiver,
            cancel_token: cancel_token.clone(),
            adapter,
            members: HashMap::new(),
            producers: HashMap::new(),
            bindings: HashMap::new(),
            max_peers,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomActorHandle {
            sender,
            cancel_token,
            room_id,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "signal.actor.room", fields(room_id = %self.room_id))]
    async fn run(mut self) {
        info!(
            target: "signal.actor.room",
            room_id = %self.room_id,
            created_at = chrono::Utc::now().timestamp(),
            "RoomActor started"
        );

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "signal.actor.room",
                        room_id = %self.room_id,
                        "RoomActor received cancellation signal"
                    );
                    break;
                }
                message = self.receiver.recv() => {
                    match message {
                        Some(message) => {
                            self.metrics.message_processed();
                            self.handle_message(message).await;
                        }
                        None => {
                            debug!(
                                target: "signal.actor.room",
                                room_id = %self.room_id,
                                "Room mailbox closed"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.shutdown_cleanup().await;

        info!(
            target: "signal.actor.room",
            room_id = %self.room_id,
            "RoomActor stopped"
        );
    }

    async fn handle_message(&mut self, message: RoomMessage) {
        match message {
            RoomMessage::Join {
                peer_id,
                events,
                respond_to,
            } => {
                let result = self.handle_join(peer_id, events);
                let _ = respond_to.send(result);
            }
            RoomMessage::Leave {
                peer_id,
                respond_to,
            } => {
                let now_empty = self.handle_leave(peer_id).await;
                let _ = respond_to.send(now_empty);
                if now_empty {
                    info!(
                        target: "signal.actor.room",
                        room_id = %self.room_id,
                        "Room is empty, cancelling"
                    );
                    self.cancel_token.cancel();
                }
            }
            RoomMessage::SetConsumeContext {
                peer_id,
                transport_id,
                rtp_capabilities,
            } => {
                if let Some(member) = self.members.get_mut(&peer_id) {
                    member.consume = Some(ConsumeContext {
                        transport_id,
                        rtp_capabilities,
                    });
                    debug!(
                        target: "signal.actor.room",
                        room_id = %self.room_id,
                        peer_id = %peer_id,
                        transport_id = %transport_id,
                        "Consume context set"
                    );
                }
            }
            RoomMessage::ClearConsumeContext {
                peer_id,
                transport_id,
            } => {
                if let Some(member) = self.members.get_mut(&peer_id) {
                    if member
                        .consume
                        .as_ref()
                        .is_some_and(|ctx| ctx.transport_id == transport_id)
                    {
                        member.consume = None;
                    }
                }
            }
            RoomMessage::RegisterProducer {
                peer_id,
                producer_id,
                kind,
                respond_to,
            } => {
                let result = self.handle_register_producer(peer_id, producer_id, kind).await;
                let _ = respond_to.send(result);
            }
            RoomMessage::UnregisterProducer {
                peer_id,
                producer_id,
                respond_to,
            } => {
                let result = self.handle_unregister_producer(peer_id, producer_id).await;
                let _ = respond_to.send(result);
            }
            RoomMessage::SetProducerPaused {
                producer_id,
                paused,
            } => {
                if let Some(entry) = self.producers.get_mut(&producer_id) {
                    entry.paused = paused;
                }
            }
            RoomMessage::Consume {
                peer_id,
                producer_id,
                respond_to,
            } => {
                let result = self.handle_consume(peer_id, producer_id).await;
                let _ = respond_to.send(result);
            }
            RoomMessage::ReleaseConsumer {
                peer_id,
                consumer_id,
            } => {
                self.handle_release_consumer(peer_id, consumer_id).await;
            }
            RoomMessage::ListProducers { respond_to } => {
                let _ = respond_to.send(self.producer_snapshot());
            }
            RoomMessage::MemberCount { respond_to } => {
                let _ = respond_to.send(self.members.len());
            }
        }
    }

    fn handle_join(
        &mut self,
        peer_id: PeerId,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<(), SignalError> {
        if let Some(member) = self.members.get_mut(&peer_id) {
            // Idempotent re-join: refresh the event channel, no membership
            // change.
            member.events = events;
            return Ok(());
        }

        if self.members.len() >= self.max_peers {
            return Err(SignalError::RoomFull(self.room_id.clone()));
        }

        self.members.insert(
            peer_id,
            Member {
                events,
                consume: None,
            },
        );
        self.metrics.peer_joined();
        info!(
            target: "signal.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            members = self.members.len(),
            "Peer joined room"
        );
        Ok(())
    }

    async fn handle_leave(&mut self, peer_id: PeerId) -> bool {
        if self.members.remove(&peer_id).is_none() {
            return self.members.is_empty();
        }
        self.metrics.peer_left();

        // The peer's connection runs the teardown cascade before leaving;
        // anything still here is a crash path, cleaned up defensively.
        let orphaned: Vec<ProducerId> = self
            .producers
            .iter()
            .filter(|(_, entry)| entry.peer_id == peer_id)
            .map(|(id, _)| *id)
            .collect();
        for producer_id in orphaned {
            if let Err(e) = self.handle_unregister_producer(peer_id, producer_id).await {
                warn!(
                    target: "signal.actor.room",
                    room_id = %self.room_id,
                    producer_id = %producer_id,
                    error = %e,
                    "Orphaned producer cleanup failed"
                );
            }
            let _ = self.adapter.close_producer(producer_id).await;
        }

        // Bindings held by the departing peer.
        for bindings in self.bindings.values_mut() {
            let mut index = 0;
            while index < bindings.len() {
                if bindings
                    .get(index)
                    .is_some_and(|binding| binding.peer_id == peer_id)
                {
                    let binding = bindings.remove(index);
                    let _ = self
                        .adapter
                        .close_consumer(binding.grant.descriptor.id)
                        .await;
                    self.metrics.consumer_removed();
                } else {
                    index += 1;
                }
            }
        }

        info!(
            target: "signal.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            members = self.members.len(),
            "Peer left room"
        );
        self.members.is_empty()
    }

    /// Matcher fan-out: pair every other ready member, notify everyone else.
    async fn handle_register_producer(
        &mut self,
        peer_id: PeerId,
        producer_id: ProducerId,
        kind: MediaKind,
    ) -> Result<(), SignalError> {
        if !self.members.contains_key(&peer_id) {
            return Err(SignalError::PeerNotReady(
                "not a member of this room".to_string(),
            ));
        }

        self.producers.insert(
            producer_id,
            ProducerEntry {
                peer_id,
                kind,
                paused: false,
            },
        );
        self.metrics.producer_added();
        info!(
            target: "signal.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            kind = %kind,
            "Producer registered"
        );

        let other_members: Vec<PeerId> = self
            .members
            .keys()
            .filter(|id| **id != peer_id)
            .copied()
            .collect();

        for member_id in other_members {
            let grant = match self.pair_consumer(member_id, producer_id).await {
                Ok(grant) => grant,
                Err(e) => {
                    // Pairing failure degrades to a plain notification; the
                    // member can pull later once its receive side is ready.
                    debug!(
                        target: "signal.actor.room",
                        room_id = %self.room_id,
                        peer_id = %member_id,
                        producer_id = %producer_id,
                        error = %e,
                        "Eager pairing skipped"
                    );
                    None
                }
            };

            self.push_event(
                member_id,
                RoomEvent::ProducerAvailable {
                    producer_id,
                    peer_id,
                    kind,
                    grant,
                },
            );
        }

        Ok(())
    }

    /// Closes every referencing consumer room-wide before returning.
    async fn handle_unregister_producer(
        &mut self,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> Result<(), SignalError> {
        let Some(entry) = self.producers.get(&producer_id) else {
            return Err(SignalError::ProducerNotFound(producer_id.to_string()));
        };
        if entry.peer_id != peer_id {
            return Err(SignalError::ProducerNotFound(producer_id.to_string()));
        }
        self.producers.remove(&producer_id);
        self.metrics.producer_removed();

        let bindings = self.bindings.remove(&producer_id).unwrap_or_default();
        let mut closed: HashMap<PeerId, ConsumerId> = HashMap::new();
        for binding in bindings {
            let consumer_id = binding.grant.descriptor.id;
            if let Err(e) = self.adapter.close_consumer(consumer_id).await {
                warn!(
                    target: "signal.actor.room",
                    room_id = %self.room_id,
                    consumer_id = %consumer_id,
                    error = %e,
                    "Consumer close failed during producer unregister"
                );
            }
            self.metrics.consumer_removed();
            closed.insert(binding.peer_id, consumer_id);
        }

        let member_ids: Vec<PeerId> = self
            .members
            .keys()
            .filter(|id| **id != peer_id)
            .copied()
            .collect();
        for member_id in member_ids {
            self.push_event(
                member_id,
                RoomEvent::ProducerClosed {
                    producer_id,
                    consumer_id: closed.get(&member_id).copied(),
                },
            );
        }

        info!(
            target: "signal.actor.room",
            room_id = %self.room_id,
            producer_id = %producer_id,
            "Producer unregistered"
        );
        Ok(())
    }

    async fn handle_consume(
        &mut self,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> Result<ConsumerGrant, SignalError> {
        if !self.producers.contains_key(&producer_id) {
            return Err(SignalError::ProducerNotFound(producer_id.to_string()));
        }

        // Idempotent: an existing binding for this (peer, producer) pair is
        // returned as-is, no second engine consumer.
        if let Some(existing) = self
            .bindings
            .get(&producer_id)
            .and_then(|bindings| bindings.iter().find(|b| b.peer_id == peer_id))
        {
            return Ok(existing.grant.clone());
        }

        self.pair_consumer(peer_id, producer_id)
            .await?
            .ok_or_else(|| {
                SignalError::PeerNotReady("no connected receive transport".to_string())
            })
    }

    /// Create an engine consumer for `peer_id` against `producer_id` if the
    /// member holds a ready receive context. `Ok(None)` means not ready.
    async fn pair_consumer(
        &mut self,
        peer_id: PeerId,
        producer_id: ProducerId,
    ) -> Result<Option<ConsumerGrant>, SignalError> {
        let Some(member) = self.members.get(&peer_id) else {
            return Err(SignalError::PeerNotReady(
                "not a member of this room".to_string(),
            ));
        };
        let Some(context) = member.consume.as_ref() else {
            return Ok(None);
        };

        let descriptor = self
            .adapter
            .create_consumer(
                context.transport_id,
                producer_id,
                context.rtp_capabilities.clone(),
            )
            .await
            .map_err(map_consume_error)?;

        let grant = ConsumerGrant {
            transport_id: context.transport_id,
            descriptor,
        };
        self.bindings
            .entry(producer_id)
            .or_default()
            .push(ConsumerBinding {
                peer_id,
                grant: grant.clone(),
            });
        self.metrics.consumer_added();
        debug!(
            target: "signal.actor.room",
            room_id = %self.room_id,
            peer_id = %peer_id,
            producer_id = %producer_id,
            consumer_id = %grant.descriptor.id,
            "Consumer paired"
        );
        Ok(Some(grant))
    }

    async fn handle_release_consumer(&mut self, peer_id: PeerId, consumer_id: ConsumerId) {
        for bindings in self.bindings.values_mut() {
            if let Some(position) = bindings
                .iter()
                .position(|b| b.peer_id == peer_id && b.grant.descriptor.id == consumer_id)
            {
                bindings.remove(position);
                self.metrics.consumer_removed();
                let _ = self.adapter.close_consumer(consumer_id).await;
                return;
            }
        }
    }

    fn producer_snapshot(&self) -> Vec<ProducerSnapshot> {
        self.producers
            .iter()
            .map(|(id, entry)| ProducerSnapshot {
                producer_id: *id,
                peer_id: entry.peer_id,
                kind: entry.kind,
                paused: entry.paused,
            })
            .collect()
    }

    // Non-blocking: a peer mid-request must never wedge the room actor.
    // A dropped push is recovered by the pull path (listProducers/consume).
    fn push_event(&self, peer_id: PeerId, event: RoomEvent) {
        if let Some(member) = self.members.get(&peer_id) {
            if let Err(e) = member.events.try_send(event) {
                debug!(
                    target: "signal.actor.room",
                    room_id = %self.room_id,
                    peer_id = %peer_id,
                    error = %e,
                    "Event push dropped"
                );
            }
        }
    }

    /// Release remaining engine handles when the actor stops.
    async fn shutdown_cleanup(&mut self) {
        for bindings in self.bindings.values() {
            for binding in bindings {
                let _ = self
                    .adapter
                    .close_consumer(binding.grant.descriptor.id)
                    .await;
                self.metrics.consumer_removed();
            }
        }
        self.bindings.clear();
        for _ in self.producers.drain() {
            self.metrics.producer_removed();
        }
        for _ in self.members.drain() {
            self.metrics.peer_left();
        }
    }
}

fn map_consume_error(error: MediaEngineError) -> SignalError {
    match error {
        MediaEngineError::Rejected(_) => SignalError::IncompatibleCapabilities,
        MediaEngineError::Closed(handle) => SignalError::TransportClosed(handle),
        MediaEngineError::UnknownHandle(handle) => {
            SignalError::NegotiationFailed(format!("engine lost handle {handle}"))
        }
        MediaEngineError::Internal(detail) => SignalError::Internal(detail),
    }
}
