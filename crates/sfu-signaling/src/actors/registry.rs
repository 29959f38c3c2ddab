//! `RoomRegistryActor` - singleton supervisor for room actors.
//!
//! Creates rooms lazily on first join, monitors child tasks (panic
//! detection), reaps rooms that emptied out and cancelled themselves, and
//! re-creates a room when a join arrives for an id whose previous actor
//! already terminated.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use media_engine::MediaEngineAdapter;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::messages::{JoinOutcome, RegistryMessage, RegistryStatus, RoomEvent};
use super::metrics::SignalMetrics;
use super::room::{RoomActor, RoomActorHandle};
use crate::errors::SignalError;
use crate::protocol::PeerId;
use crate::router::RouterRegistry;

/// Channel buffer size for the registry mailbox.
const REGISTRY_CHANNEL_BUFFER: usize = 256;

/// Interval between child health sweeps.
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);

/// Handle to the `RoomRegistryActor`.
#[derive(Clone)]
pub struct RoomRegistryHandle {
    sender: mpsc::Sender<RegistryMessage>,
    cancel_token: CancellationToken,
}

impl RoomRegistryHandle {
    /// Route a peer into a room, creating the room if needed. Returns the
    /// router capabilities and a handle to the room actor.
    pub async fn join_room(
        &self,
        room_id: String,
        peer_id: PeerId,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<JoinOutcome, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::JoinRoom {
                room_id,
                peer_id,
                events,
                respond_to: tx,
            })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalError::Internal(format!("response receive failed: {e}")))?
    }

    /// Registry status snapshot.
    pub async fn status(&self) -> Result<RegistryStatus, SignalError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(RegistryMessage::GetStatus { respond_to: tx })
            .await
            .map_err(|e| SignalError::Internal(format!("channel send failed: {e}")))?;

        rx.await
            .map_err(|e| SignalError::Internal(format!("response receive failed: {e}")))
    }

    /// Begin shutdown: cancels the registry and, through child tokens,
    /// every room actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    /// Check if the registry is cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Get a child token (connection tasks hang off the registry's token).
    #[must_use]
    pub fn child_token(&self) -> CancellationToken {
        self.cancel_token.child_token()
    }
}

/// A supervised room.
struct ManagedRoom {
    handle: RoomActorHandle,
    task_handle: JoinHandle<()>,
}

/// The `RoomRegistryActor` implementation.
pub struct RoomRegistryActor {
    receiver: mpsc::Receiver<RegistryMessage>,
    cancel_token: CancellationToken,
    adapter: Arc<dyn MediaEngineAdapter>,
    routers: Arc<RouterRegistry>,
    rooms: HashMap<String, ManagedRoom>,
    max_peers_per_room: usize,
    metrics: Arc<SignalMetrics>,
}

impl RoomRegistryActor {
    /// Spawn the registry actor.
    ///
    /// Returns a handle and the task join handle.
    pub fn spawn(
        adapter: Arc<dyn MediaEngineAdapter>,
        routers: Arc<RouterRegistry>,
        metrics: Arc<SignalMetrics>,
        max_peers_per_room: usize,
    ) -> (RoomRegistryHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(REGISTRY_CHANNEL_BUFFER);
        let cancel_token = CancellationToken::new();

        let actor = Self {
            receiver,
            cancel_token: cancel_token.clone(),
            adapter,
            routers,
            rooms: HashMap::new(),
            max_peers_per_room,
            metrics,
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = RoomRegistryHandle {
            sender,
            cancel_token,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "signal.actor.registry")]
    async fn run(mut self) {
        info!(target: "signal.actor.registry", "RoomRegistryActor started");

        let mut health_ticker = tokio::time::interval(HEALTH_CHECK_INTERVAL);
        health_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "signal.actor.registry",
                        "RoomRegistryActor received cancellation signal"
                    );
                    break;
                }
                _ = health_ticker.tick() => {
                    self.check_room_health().await;
                }
                message = self.receiver.recv() => {
                    match message {
                        Some(message) => {
                            self.metrics.message_processed();
                            self.handle_message(message).await;
                        }
                        None => {
                            debug!(
                                target: "signal.actor.registry",
                                "Registry mailbox closed"
                            );
                            break;
                        }
                    }
                }
            }
        }

        self.graceful_shutdown().await;
        info!(target: "signal.actor.registry", "RoomRegistryActor stopped");
    }

    async fn handle_message(&mut self, message: RegistryMessage) {
        match message {
            RegistryMessage::JoinRoom {
                room_id,
                peer_id,
                events,
                respond_to,
            } => {
                let result = self.handle_join_room(room_id, peer_id, events).await;
                let _ = respond_to.send(result);
            }
            RegistryMessage::GetStatus { respond_to } => {
                let _ = respond_to.send(RegistryStatus {
                    active_rooms: self.rooms.len(),
                });
            }
        }
    }

    async fn handle_join_room(
        &mut self,
        room_id: String,
        peer_id: PeerId,
        events: mpsc::Sender<RoomEvent>,
    ) -> Result<JoinOutcome, SignalError> {
        // Joins fail until the global router exists
        let rtp_capabilities = self.routers.capabilities().await?;

        let room = self.live_room(&room_id);
        match room.join(peer_id, events.clone()).await {
            Ok(()) => Ok(JoinOutcome {
                rtp_capabilities,
                room,
            }),
            Err(SignalError::Internal(detail)) => {
                // The room actor terminated between the liveness check and
                // the join (it empties out and cancels itself). Re-create
                // once and retry.
                debug!(
                    target: "signal.actor.registry",
                    room_id = %room_id,
                    detail = %detail,
                    "Join hit a terminated room actor, re-creating"
                );
                self.rooms.remove(&room_id);
                let room = self.live_room(&room_id);
                room.join(peer_id, events).await?;
                Ok(JoinOutcome {
                    rtp_capabilities,
                    room,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Get a live handle for the room, spawning a fresh actor if there is
    /// none or the previous one terminated.
    fn live_room(&mut self, room_id: &str) -> RoomActorHandle {
        let stale = self
            .rooms
            .get(room_id)
            .is_some_and(|managed| {
                managed.handle.is_cancelled() || managed.task_handle.is_finished()
            });
        if stale {
            self.rooms.remove(room_id);
        }

        if let Some(managed) = self.rooms.get(room_id) {
            return managed.handle.clone();
        }

        let (handle, task_handle) = RoomActor::spawn(
            room_id.to_string(),
            self.cancel_token.child_token(),
            Arc::clone(&self.adapter),
            Arc::clone(&self.metrics),
            self.max_peers_per_room,
        );
        info!(
            target: "signal.actor.registry",
            room_id = %room_id,
            active_rooms = self.rooms.len() + 1,
            "Room created"
        );
        self.rooms.insert(
            room_id.to_string(),
            ManagedRoom {
                handle: handle.clone(),
                task_handle,
            },
        );
        self.metrics.set_rooms(self.rooms.len());
        handle
    }

    /// Reap finished room tasks, logging panics.
    async fn check_room_health(&mut self) {
        let mut finished = Vec::new();
        for (room_id, managed) in &mut self.rooms {
            if managed.task_handle.is_finished() {
                match (&mut managed.task_handle).await {
                    Ok(()) => {
                        info!(
                            target: "signal.actor.registry",
                            room_id = %room_id,
                            "Room task completed"
                        );
                    }
                    Err(e) if e.is_panic() => {
                        error!(
                            target: "signal.actor.registry",
                            room_id = %room_id,
                            "Room task panicked"
                        );
                    }
                    Err(e) => {
                        warn!(
                            target: "signal.actor.registry",
                            room_id = %room_id,
                            error = %e,
                            "Room task aborted"
                        );
                    }
                }
                finished.push(room_id.clone());
            }
        }

        for room_id in finished {
            self.rooms.remove(&room_id);
        }
        self.metrics.set_rooms(self.rooms.len());
    }

    /// Cancel every room and await their tasks.
    async fn graceful_shutdown(&mut self) {
        for managed in self.rooms.values() {
            managed.handle.cancel();
        }
        for (room_id, managed) in self.rooms.drain() {
            if let Err(e) = managed.task_handle.await {
                if e.is_panic() {
                    error!(
                        target: "signal.actor.registry",
                        room_id = %room_id,
                        "Room task panicked during shutdown"
                    );
                }
            }
        }
        self.metrics.set_rooms(0);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::default_media_codecs;
    use media_engine::LocalMediaEngine;

    async fn rig(initialize_router: bool) -> (RoomRegistryHandle, JoinHandle<()>) {
        let engine: Arc<dyn MediaEngineAdapter> = Arc::new(LocalMediaEngine::new());
        let routers = Arc::new(RouterRegistry::new(Arc::clone(&engine)));
        if initialize_router {
            routers.initialize(default_media_codecs()).await.unwrap();
        }
        RoomRegistryActor::spawn(engine, routers, SignalMetrics::new(), 8)
    }

    #[tokio::test]
    async fn test_join_before_router_init_fails() {
        let (registry, _task) = rig(false).await;
        let (events, _rx) = mpsc::channel(8);

        let result = registry
            .join_room("demo".to_string(), PeerId::new(), events)
            .await;
        assert!(matches!(result, Err(SignalError::RouterNotReady)));

        let status = registry.status().await.unwrap();
        assert_eq!(status.active_rooms, 0);
    }

    #[tokio::test]
    async fn test_join_creates_room_lazily() {
        let (registry, _task) = rig(true).await;
        let (events, _rx) = mpsc::channel(8);

        let outcome = registry
            .join_room("demo".to_string(), PeerId::new(), events)
            .await
            .unwrap();
        assert_eq!(outcome.room.room_id(), "demo");
        assert_eq!(outcome.rtp_capabilities.codecs.len(), 2);

        let status = registry.status().await.unwrap();
        assert_eq!(status.active_rooms, 1);
    }

    #[tokio::test]
    async fn test_two_rooms_are_independent() {
        let (registry, _task) = rig(true).await;

        let (events_a, _rx_a) = mpsc::channel(8);
        let a = registry
            .join_room("alpha".to_string(), PeerId::new(), events_a)
            .await
            .unwrap();
        let (events_b, _rx_b) = mpsc::channel(8);
        let b = registry
            .join_room("beta".to_string(), PeerId::new(), events_b)
            .await
            .unwrap();

        assert_ne!(a.room.room_id(), b.room.room_id());
        assert_eq!(registry.status().await.unwrap().active_rooms, 2);
    }

    #[tokio::test]
    async fn test_join_after_room_emptied_recreates_it() {
        let (registry, _task) = rig(true).await;

        let peer = PeerId::new();
        let (events, _rx) = mpsc::channel(8);
        let outcome = registry
            .join_room("demo".to_string(), peer, events)
            .await
            .unwrap();

        // Last member leaves; the room cancels itself
        assert!(outcome.room.leave(peer).await.unwrap());
        assert!(outcome.room.is_cancelled());

        // A later join must land in a fresh actor
        let (events, _rx) = mpsc::channel(8);
        let outcome = registry
            .join_room("demo".to_string(), PeerId::new(), events)
            .await
            .unwrap();
        assert_eq!(outcome.room.member_count().await.unwrap(), 1);
        assert!(!outcome.room.is_cancelled());
    }
}
